use crate::call_frame::CallFrame;
use crate::objects::object::{Object, ObjectType};
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::value::{make_object_value, make_sentinel_value, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    Suspended,
    Running,
    Completed,
    Errored,
}

/// The caller record captured by an await: the awaiter's entire execution
/// context, restored verbatim when the callee yields or completes.
/// `coroutine` is null when the awaiter was the main context.
pub struct SavedCaller {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub open_upvalues: Vec<*mut ObjectUpvalue>,
    pub coroutine: *mut ObjectCoroutine,
}

/// An independent execution context. While suspended, the stack, frames
/// and open upvalues live here; while running they are installed in the
/// VM and these vectors are empty.
#[repr(C)]
pub struct ObjectCoroutine {
    pub object: Object,
    pub closure: *mut ObjectClosure,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub open_upvalues: Vec<*mut ObjectUpvalue>,
    pub status: CoroutineStatus,
    pub resume_value: Value,
    pub started: bool,
    pub resumed_by: Option<Box<SavedCaller>>,
}

impl ObjectCoroutine {
    /// Seeds frame 0 as if an initial call had been performed: slot 0
    /// holds the closure, arguments (if any) follow.
    pub fn new(closure: *mut ObjectClosure) -> Self {
        let closure_value = make_object_value(closure as *mut Object);
        ObjectCoroutine {
            object: Object::new(ObjectType::Coroutine),
            closure,
            stack: vec![closure_value],
            frames: vec![CallFrame::new(closure, 0)],
            open_upvalues: Vec::new(),
            status: CoroutineStatus::Suspended,
            resume_value: make_sentinel_value(),
            started: false,
            resumed_by: None,
        }
    }
}
