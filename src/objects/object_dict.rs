use std::collections::HashMap;

use crate::objects::object::{Object, ObjectType};
use crate::objects::object_string::ObjectString;
use crate::value::Value;

/// Keys are interned string objects, so address equality is byte equality
/// and the map can hash the pointer directly.
#[repr(C)]
pub struct ObjectDict {
    pub object: Object,
    pub entries: HashMap<*mut ObjectString, Value>,
}

impl ObjectDict {
    pub fn new(entries: HashMap<*mut ObjectString, Value>) -> Self {
        ObjectDict {
            object: Object::new(ObjectType::Dict),
            entries,
        }
    }
}
