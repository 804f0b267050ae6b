use crate::chunk::Chunk;
use crate::objects::object::{Object, ObjectType};

/// A compiled function: its bytecode plus the metadata the VM needs to
/// call it. `name` is `None` for the top-level script and `Some("")` for
/// anonymous functions.
#[repr(C)]
pub struct ObjectFunction {
    pub object: Object,
    pub arity: u8,
    pub upvalue_count: usize,
    pub name: Option<String>,
    pub chunk: Chunk,
}

impl ObjectFunction {
    pub fn new(name: Option<String>) -> Self {
        ObjectFunction {
            object: Object::new(ObjectType::Function),
            arity: 0,
            upvalue_count: 0,
            name,
            chunk: Chunk::new(),
        }
    }
}
