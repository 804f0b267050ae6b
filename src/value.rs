use crate::objects::object::{Object, ObjectType};
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_coroutine::ObjectCoroutine;
use crate::objects::object_dict::ObjectDict;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_list::ObjectList;
use crate::objects::object_native_function::ObjectNativeFunction;
use crate::objects::object_string::ObjectString;

pub type ValueArray = Vec<Value>;

#[cfg(feature = "nan_boxing")]
mod repr {
    use super::*;

    const SIGN_BIT: u64 = 0x8000_0000_0000_0000;
    const QNAN: u64 = 0x7ffc_0000_0000_0000;

    const TAG_NIL: u64 = 1;
    const TAG_FALSE: u64 = 2;
    const TAG_TRUE: u64 = 3;
    const TAG_SENTINEL: u64 = 4;

    /// A 64-bit NaN-boxed value. Numbers are stored as raw IEEE-754 doubles;
    /// every other variant lives in the payload bits of a quiet NaN.
    #[derive(Clone, Copy)]
    pub struct Value(u64);

    pub fn make_nil_value() -> Value {
        Value(QNAN | TAG_NIL)
    }

    pub fn make_bool_value(boolean: bool) -> Value {
        Value(QNAN | if boolean { TAG_TRUE } else { TAG_FALSE })
    }

    pub fn make_number_value(number: f64) -> Value {
        Value(number.to_bits())
    }

    pub fn make_object_value(object: *mut Object) -> Value {
        Value(SIGN_BIT | QNAN | object as u64)
    }

    pub fn make_sentinel_value() -> Value {
        Value(QNAN | TAG_SENTINEL)
    }

    pub fn is_nil(value: &Value) -> bool {
        value.0 == QNAN | TAG_NIL
    }

    pub fn is_bool(value: &Value) -> bool {
        value.0 | 1 == QNAN | TAG_TRUE
    }

    pub fn is_number(value: &Value) -> bool {
        value.0 & QNAN != QNAN
    }

    pub fn is_object(value: &Value) -> bool {
        value.0 & (SIGN_BIT | QNAN) == SIGN_BIT | QNAN
    }

    pub fn is_sentinel(value: &Value) -> bool {
        value.0 == QNAN | TAG_SENTINEL
    }

    pub fn as_bool(value: &Value) -> bool {
        value.0 == QNAN | TAG_TRUE
    }

    pub fn as_number(value: &Value) -> f64 {
        f64::from_bits(value.0)
    }

    pub fn as_object(value: &Value) -> *mut Object {
        (value.0 & !(SIGN_BIT | QNAN)) as *mut Object
    }

    pub fn values_equal(left: &Value, right: &Value) -> bool {
        if is_number(left) && is_number(right) {
            return as_number(left) == as_number(right);
        }
        left.0 == right.0
    }
}

#[cfg(not(feature = "nan_boxing"))]
mod repr {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ValueType {
        Nil,
        Bool,
        Number,
        Object,
        Sentinel,
    }

    #[derive(Clone, Copy)]
    #[repr(C)]
    pub union ValueUnion {
        pub boolean: bool,
        pub number: f64,
        pub object: *mut Object,
    }

    #[derive(Clone, Copy)]
    pub struct Value {
        pub value_type: ValueType,
        pub value_as: ValueUnion,
    }

    pub fn make_nil_value() -> Value {
        Value {
            value_type: ValueType::Nil,
            value_as: ValueUnion { number: 0.0 },
        }
    }

    pub fn make_bool_value(boolean: bool) -> Value {
        Value {
            value_type: ValueType::Bool,
            value_as: ValueUnion { boolean },
        }
    }

    pub fn make_number_value(number: f64) -> Value {
        Value {
            value_type: ValueType::Number,
            value_as: ValueUnion { number },
        }
    }

    pub fn make_object_value(object: *mut Object) -> Value {
        Value {
            value_type: ValueType::Object,
            value_as: ValueUnion { object },
        }
    }

    pub fn make_sentinel_value() -> Value {
        Value {
            value_type: ValueType::Sentinel,
            value_as: ValueUnion { number: 0.0 },
        }
    }

    pub fn is_nil(value: &Value) -> bool {
        value.value_type == ValueType::Nil
    }

    pub fn is_bool(value: &Value) -> bool {
        value.value_type == ValueType::Bool
    }

    pub fn is_number(value: &Value) -> bool {
        value.value_type == ValueType::Number
    }

    pub fn is_object(value: &Value) -> bool {
        value.value_type == ValueType::Object
    }

    pub fn is_sentinel(value: &Value) -> bool {
        value.value_type == ValueType::Sentinel
    }

    pub fn as_bool(value: &Value) -> bool {
        unsafe { value.value_as.boolean }
    }

    pub fn as_number(value: &Value) -> f64 {
        unsafe { value.value_as.number }
    }

    pub fn as_object(value: &Value) -> *mut Object {
        unsafe { value.value_as.object }
    }

    pub fn values_equal(left: &Value, right: &Value) -> bool {
        if left.value_type != right.value_type {
            return false;
        }
        match left.value_type {
            ValueType::Nil | ValueType::Sentinel => true,
            ValueType::Bool => as_bool(left) == as_bool(right),
            ValueType::Number => as_number(left) == as_number(right),
            ValueType::Object => as_object(left) == as_object(right),
        }
    }
}

#[cfg(not(feature = "nan_boxing"))]
pub use repr::{ValueType, ValueUnion};
pub use repr::{
    as_bool, as_number, as_object, is_bool, is_nil, is_number, is_object, is_sentinel,
    make_bool_value, make_nil_value, make_number_value, make_object_value, make_sentinel_value,
    values_equal, Value,
};

pub fn object_kind(value: &Value) -> Option<ObjectType> {
    if !is_object(value) {
        return None;
    }
    Some(unsafe { (*as_object(value)).obj_type })
}

pub fn is_obj_kind(value: &Value, kind: ObjectType) -> bool {
    object_kind(value) == Some(kind)
}

pub fn is_string(value: &Value) -> bool {
    is_obj_kind(value, ObjectType::String)
}

pub fn is_closure(value: &Value) -> bool {
    is_obj_kind(value, ObjectType::Closure)
}

pub fn is_coroutine(value: &Value) -> bool {
    is_obj_kind(value, ObjectType::Coroutine)
}

pub fn is_list(value: &Value) -> bool {
    is_obj_kind(value, ObjectType::List)
}

pub fn is_dict(value: &Value) -> bool {
    is_obj_kind(value, ObjectType::Dict)
}

pub fn format_value(value: &Value) -> String {
    if is_nil(value) {
        return "nil".to_string();
    }
    if is_bool(value) {
        return if as_bool(value) { "true" } else { "false" }.to_string();
    }
    if is_number(value) {
        return format!("{}", as_number(value));
    }
    if is_sentinel(value) {
        return "<sentinel>".to_string();
    }
    format_object(as_object(value))
}

fn format_function(function: *const ObjectFunction) -> String {
    match unsafe { (*function).name.as_deref() } {
        Some(name) if !name.is_empty() => format!("<fn {}>", name),
        Some(_) => "<fn>".to_string(),
        None => "<script>".to_string(),
    }
}

fn format_object(object: *mut Object) -> String {
    unsafe {
        match (*object).obj_type {
            ObjectType::String => (*(object as *mut ObjectString)).content.clone(),
            ObjectType::Function => format_function(object as *const ObjectFunction),
            ObjectType::Closure => format_function((*(object as *mut ObjectClosure)).function),
            ObjectType::Upvalue => "upvalue".to_string(),
            ObjectType::Native => {
                format!("<native fn {}>", (*(object as *mut ObjectNativeFunction)).name)
            }
            ObjectType::List => {
                let list = &*(object as *mut ObjectList);
                let elements: Vec<String> = list.elements.iter().map(format_value).collect();
                format!("[{}]", elements.join(", "))
            }
            ObjectType::Dict => {
                let dict = &*(object as *mut ObjectDict);
                let entries: Vec<String> = dict
                    .entries
                    .iter()
                    .map(|(key, value)| {
                        format!("{}: {}", (**key).content, format_value(value))
                    })
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            ObjectType::Coroutine => {
                let coroutine = &*(object as *mut ObjectCoroutine);
                let function = (*coroutine.closure).function;
                match (*function).name.as_deref() {
                    Some(name) if !name.is_empty() => format!("<coroutine {}>", name),
                    _ => "<coroutine>".to_string(),
                }
            }
        }
    }
}

pub fn print_value(value: &Value) {
    print!("{}", format_value(value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_round_trip() {
        let value = make_number_value(1.25);
        assert!(is_number(&value));
        assert!(!is_object(&value));
        assert_eq!(as_number(&value), 1.25);
    }

    #[test]
    fn singletons_are_distinct() {
        assert!(is_nil(&make_nil_value()));
        assert!(!is_bool(&make_nil_value()));
        assert!(is_bool(&make_bool_value(false)));
        assert!(!as_bool(&make_bool_value(false)));
        assert!(as_bool(&make_bool_value(true)));
        assert!(is_sentinel(&make_sentinel_value()));
        assert!(!is_nil(&make_sentinel_value()));
    }

    #[test]
    fn number_equality_is_ieee() {
        let zero = make_number_value(0.0);
        let negative_zero = make_number_value(-0.0);
        assert!(values_equal(&zero, &negative_zero));

        let nan = make_number_value(f64::NAN);
        assert!(!values_equal(&nan, &nan));
    }

    #[test]
    fn nil_is_not_zero() {
        assert!(!values_equal(&make_nil_value(), &make_number_value(0.0)));
        assert!(!values_equal(&make_nil_value(), &make_bool_value(false)));
    }

    #[test]
    fn formats_primitives() {
        assert_eq!(format_value(&make_nil_value()), "nil");
        assert_eq!(format_value(&make_bool_value(true)), "true");
        assert_eq!(format_value(&make_number_value(3.0)), "3");
        assert_eq!(format_value(&make_number_value(2.5)), "2.5");
    }
}
