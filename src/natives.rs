use std::time::{SystemTime, UNIX_EPOCH};

use crate::objects::object::ObjectType;
use crate::objects::object_dict::ObjectDict;
use crate::objects::object_list::ObjectList;
use crate::objects::object_string::ObjectString;
use crate::value::{
    as_object, format_value, is_object, make_nil_value, make_number_value, Value,
};

/// Variadic: prints all arguments separated by spaces, then a newline.
pub fn print_native(args: &[Value]) -> Result<Value, String> {
    let rendered: Vec<String> = args.iter().map(format_value).collect();
    println!("{}", rendered.join(" "));
    Ok(make_nil_value())
}

pub fn clock_native(_args: &[Value]) -> Result<Value, String> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "System clock went backwards.".to_string())?;
    Ok(make_number_value(elapsed.as_secs_f64()))
}

pub fn len_native(args: &[Value]) -> Result<Value, String> {
    let Some(value) = args.first() else {
        return Err("len() expects one argument.".to_string());
    };
    if !is_object(value) {
        return Err("len() expects a string, list, or dict.".to_string());
    }
    let object = as_object(value);
    let length = unsafe {
        match (*object).obj_type {
            ObjectType::String => (&(*(object as *mut ObjectString)).content).len(),
            ObjectType::List => (*(object as *mut ObjectList)).elements.len(),
            ObjectType::Dict => (*(object as *mut ObjectDict)).entries.len(),
            _ => return Err("len() expects a string, list, or dict.".to_string()),
        }
    };
    Ok(make_number_value(length as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{as_number, is_nil, make_bool_value};

    #[test]
    fn clock_returns_a_number() {
        let value = clock_native(&[]).unwrap();
        assert!(as_number(&value) > 0.0);
    }

    #[test]
    fn print_returns_nil() {
        let value = print_native(&[make_number_value(1.0)]).unwrap();
        assert!(is_nil(&value));
    }

    #[test]
    fn len_rejects_primitives() {
        assert!(len_native(&[make_bool_value(true)]).is_err());
    }
}
