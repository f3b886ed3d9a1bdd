//! Conversion between engine values and [`RuntimeValue`].

use std::collections::BTreeMap;

use rquickjs::{Array, Ctx, Function, Object, String as JsString, Value};

use crate::value::RuntimeValue;

#[derive(Debug, thiserror::Error)]
#[error("unsupported script value: {0}")]
pub(crate) struct UnsupportedValue(pub &'static str);

/// Convert a script value into a runtime value.
///
/// Functions, symbols and pending promises have no boundary representation
/// and are rejected; `undefined` collapses to null.
pub(crate) fn js_to_value(value: &Value<'_>) -> Result<RuntimeValue, UnsupportedValue> {
    if value.is_undefined() || value.is_null() {
        return Ok(RuntimeValue::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(RuntimeValue::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(RuntimeValue::Int(i64::from(i)));
    }
    if let Some(f) = value.as_float() {
        return Ok(RuntimeValue::Float(f));
    }
    if let Some(s) = value.as_string() {
        return s
            .to_string()
            .map(RuntimeValue::String)
            .map_err(|_| UnsupportedValue("string"));
    }
    if let Some(array) = value.as_array() {
        let mut items = Vec::with_capacity(array.len());
        for i in 0..array.len() {
            let item: Value = array.get(i).map_err(|_| UnsupportedValue("array element"))?;
            items.push(js_to_value(&item)?);
        }
        return Ok(RuntimeValue::List(items));
    }
    if value.is_function() {
        return Err(UnsupportedValue("function"));
    }
    if let Some(object) = value.as_object() {
        // Promises and other thenables have no boundary representation.
        if object
            .get::<_, Value>("then")
            .is_ok_and(|then| then.is_function())
        {
            return Err(UnsupportedValue("thenable"));
        }
        let mut map = BTreeMap::new();
        for prop in object.props::<String, Value>() {
            let (key, item) = prop.map_err(|_| UnsupportedValue("object property"))?;
            map.insert(key, js_to_value(&item)?);
        }
        return Ok(RuntimeValue::Map(map));
    }
    Err(UnsupportedValue("value"))
}

/// Convert a runtime value into a script value.
pub(crate) fn value_to_js<'js>(
    ctx: &Ctx<'js>,
    value: &RuntimeValue,
) -> rquickjs::Result<Value<'js>> {
    Ok(match value {
        RuntimeValue::Null => Value::new_null(ctx.clone()),
        RuntimeValue::Bool(b) => Value::new_bool(ctx.clone(), *b),
        RuntimeValue::Int(i) => i32::try_from(*i).map_or_else(
            |_| Value::new_float(ctx.clone(), *i as f64),
            |i| Value::new_int(ctx.clone(), i),
        ),
        RuntimeValue::Float(f) => Value::new_float(ctx.clone(), *f),
        RuntimeValue::String(s) => JsString::from_str(ctx.clone(), s)?.into_value(),
        RuntimeValue::List(items) => {
            let array = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                array.set(i, value_to_js(ctx, item)?)?;
            }
            array.into_value()
        }
        RuntimeValue::Map(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map {
                object.set(key.as_str(), value_to_js(ctx, item)?)?;
            }
            object.into_value()
        }
    })
}

/// Builds deeply frozen script values for the `$args` and `$scope` bindings.
pub(crate) struct Freezer<'js> {
    freeze: Function<'js>,
}

impl<'js> Freezer<'js> {
    pub(crate) fn new(ctx: &Ctx<'js>) -> rquickjs::Result<Self> {
        let object: Object = ctx.globals().get("Object")?;
        Ok(Self {
            freeze: object.get("freeze")?,
        })
    }

    pub(crate) fn freeze(&self, value: &Value<'js>) -> rquickjs::Result<()> {
        if value.is_object() {
            let _: Value = self.freeze.call((value.clone(),))?;
        }
        Ok(())
    }

    pub(crate) fn deep_frozen(
        &self,
        ctx: &Ctx<'js>,
        value: &RuntimeValue,
    ) -> rquickjs::Result<Value<'js>> {
        let converted = match value {
            RuntimeValue::List(items) => {
                let array = Array::new(ctx.clone())?;
                for (i, item) in items.iter().enumerate() {
                    array.set(i, self.deep_frozen(ctx, item)?)?;
                }
                array.into_value()
            }
            RuntimeValue::Map(map) => {
                let object = Object::new(ctx.clone())?;
                for (key, item) in map {
                    object.set(key.as_str(), self.deep_frozen(ctx, item)?)?;
                }
                object.into_value()
            }
            other => value_to_js(ctx, other)?,
        };
        self.freeze(&converted)?;
        Ok(converted)
    }
}
