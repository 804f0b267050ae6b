use crate::objects::object::{Object, ObjectType};
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_upvalue::ObjectUpvalue;

/// Runtime pairing of a function with its captured environment. The
/// upvalue array length always equals the function's declared
/// `upvalue_count`; the slots are filled by the Closure opcode.
#[repr(C)]
pub struct ObjectClosure {
    pub object: Object,
    pub function: *mut ObjectFunction,
    pub upvalues: Vec<*mut ObjectUpvalue>,
}

impl ObjectClosure {
    pub fn new(function: *mut ObjectFunction) -> Self {
        let upvalue_count = unsafe { (*function).upvalue_count };
        ObjectClosure {
            object: Object::new(ObjectType::Closure),
            function,
            upvalues: vec![std::ptr::null_mut(); upvalue_count],
        }
    }
}
