pub mod object;
pub mod object_closure;
pub mod object_coroutine;
pub mod object_dict;
pub mod object_function;
pub mod object_list;
pub mod object_manager;
pub mod object_native_function;
pub mod object_string;
pub mod object_upvalue;
