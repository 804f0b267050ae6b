use std::mem::size_of;

use crate::value::Value;

use super::{
    object_closure::ObjectClosure,
    object_coroutine::ObjectCoroutine,
    object_dict::ObjectDict,
    object_function::ObjectFunction,
    object_list::ObjectList,
    object_native_function::ObjectNativeFunction,
    object_string::ObjectString,
    object_upvalue::ObjectUpvalue,
};

#[repr(u8)]
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub enum ObjectType {
    String,
    Function,
    Closure,
    Upvalue,
    List,
    Dict,
    Native,
    Coroutine,
}

/// Common header embedded at the start of every heap object. The `marked`
/// bit belongs to the collector: set while tracing, cleared again by the
/// sweep the object survives.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Object {
    pub obj_type: ObjectType,
    pub marked: bool,
}

impl Object {
    pub fn new(obj_type: ObjectType) -> Self {
        Object {
            obj_type,
            marked: false,
        }
    }

    /// Compute the deep size of the concrete object this header belongs to.
    /// Safety: caller guarantees `self` is embedded at the start of the
    /// concrete object.
    pub unsafe fn deep_size(&self) -> usize {
        match self.obj_type {
            ObjectType::String => (*(self as *const _ as *const ObjectString)).deep_size(),
            ObjectType::Function => (*(self as *const _ as *const ObjectFunction)).deep_size(),
            ObjectType::Closure => (*(self as *const _ as *const ObjectClosure)).deep_size(),
            ObjectType::Upvalue => (*(self as *const _ as *const ObjectUpvalue)).deep_size(),
            ObjectType::List => (*(self as *const _ as *const ObjectList)).deep_size(),
            ObjectType::Dict => (*(self as *const _ as *const ObjectDict)).deep_size(),
            ObjectType::Native => {
                (*(self as *const _ as *const ObjectNativeFunction)).deep_size()
            }
            ObjectType::Coroutine => {
                (*(self as *const _ as *const ObjectCoroutine)).deep_size()
            }
        }
    }

    #[inline]
    pub unsafe fn as_string(&self) -> &ObjectString {
        debug_assert!(matches!(self.obj_type, ObjectType::String));
        &*(self as *const _ as *const ObjectString)
    }

    #[inline]
    pub unsafe fn as_function(&self) -> &ObjectFunction {
        debug_assert!(matches!(self.obj_type, ObjectType::Function));
        &*(self as *const _ as *const ObjectFunction)
    }

    #[inline]
    pub unsafe fn as_closure(&self) -> &ObjectClosure {
        debug_assert!(matches!(self.obj_type, ObjectType::Closure));
        &*(self as *const _ as *const ObjectClosure)
    }

    #[inline]
    pub unsafe fn as_upvalue(&self) -> &ObjectUpvalue {
        debug_assert!(matches!(self.obj_type, ObjectType::Upvalue));
        &*(self as *const _ as *const ObjectUpvalue)
    }

    #[inline]
    pub unsafe fn as_list(&self) -> &ObjectList {
        debug_assert!(matches!(self.obj_type, ObjectType::List));
        &*(self as *const _ as *const ObjectList)
    }

    #[inline]
    pub unsafe fn as_dict(&self) -> &ObjectDict {
        debug_assert!(matches!(self.obj_type, ObjectType::Dict));
        &*(self as *const _ as *const ObjectDict)
    }

    #[inline]
    pub unsafe fn as_coroutine(&self) -> &ObjectCoroutine {
        debug_assert!(matches!(self.obj_type, ObjectType::Coroutine));
        &*(self as *const _ as *const ObjectCoroutine)
    }
}

/// Heap accounting for GC-managed structures: owned bytes only. Referenced
/// GC objects are reachable through their own headers and are not counted.
pub trait GcSize {
    fn shallow_size(&self) -> usize;
    fn deep_size(&self) -> usize;
}

impl GcSize for ObjectString {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectString>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.content.capacity()
    }
}

impl GcSize for ObjectFunction {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectFunction>()
    }
    fn deep_size(&self) -> usize {
        let name_bytes = self.name.as_ref().map_or(0, |name| name.capacity());
        self.shallow_size() + name_bytes + self.chunk.deep_size()
    }
}

impl GcSize for ObjectClosure {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectClosure>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.upvalues.capacity() * size_of::<*mut ObjectUpvalue>()
    }
}

impl GcSize for ObjectUpvalue {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectUpvalue>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size()
    }
}

impl GcSize for ObjectList {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectList>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.elements.capacity() * size_of::<Value>()
    }
}

impl GcSize for ObjectDict {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectDict>()
    }
    fn deep_size(&self) -> usize {
        let entry_bytes = size_of::<*mut ObjectString>() + size_of::<Value>();
        self.shallow_size() + self.entries.capacity() * entry_bytes
    }
}

impl GcSize for ObjectNativeFunction {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectNativeFunction>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.name.capacity()
    }
}

impl GcSize for ObjectCoroutine {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectCoroutine>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size()
            + self.stack.capacity() * size_of::<Value>()
            + self.frames.capacity() * size_of::<crate::call_frame::CallFrame>()
            + self.open_upvalues.capacity() * size_of::<*mut ObjectUpvalue>()
    }
}
