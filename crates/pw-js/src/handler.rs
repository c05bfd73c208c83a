//! Host-side view of a registered handler.
//!
//! The interceptor never holds live engine objects. Whatever registered the
//! handler describes it as source text, a `name`, and a shallow property map,
//! which is all the signature matcher and unwrapper need.

/// Own property flag set on the engine's diagnostic listener.
pub const INTERNAL_MARKER_PROPERTY: &str = "__pw_internal__";

pub use pw_core::NATIVE_CODE_PLACEHOLDER;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerValue {
    pub source: String,
    pub name: String,
    pub properties: Vec<HandlerProperty>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerProperty {
    pub name: String,
    pub value: PropertyValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Function(Box<HandlerValue>),
    Boolean(bool),
    Other,
}

impl PropertyValue {
    /// JS truthiness, treating opaque values as present.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Boolean(false))
    }
}

impl HandlerValue {
    pub fn function(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.push(HandlerProperty {
            name: name.into(),
            value,
        });
        self
    }

    pub fn with_function_property(self, name: impl Into<String>, value: HandlerValue) -> Self {
        self.with_property(name, PropertyValue::Function(Box::new(value)))
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|property| property.name == name)
            .map(|property| &property.value)
    }

    pub fn function_property(&self, name: &str) -> Option<&HandlerValue> {
        match self.property(name) {
            Some(PropertyValue::Function(value)) => Some(value),
            _ => None,
        }
    }

    pub fn function_properties(&self) -> impl Iterator<Item = &HandlerValue> {
        self.properties
            .iter()
            .filter_map(|property| match &property.value {
                PropertyValue::Function(value) => Some(value.as_ref()),
                _ => None,
            })
    }

    pub fn boolean_property_count(&self) -> usize {
        self.properties
            .iter()
            .filter(|property| matches!(property.value, PropertyValue::Boolean(_)))
            .count()
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self.property(INTERNAL_MARKER_PROPERTY),
            Some(PropertyValue::Boolean(true))
        )
    }

    /// `Function.prototype.bind` results report `bound <target>` as their name.
    pub fn bound_name(&self) -> Option<&str> {
        if self.name.starts_with("bound ") {
            Some(&self.name)
        } else {
            None
        }
    }

    pub fn is_native_placeholder(&self) -> bool {
        self.source == NATIVE_CODE_PLACEHOLDER
    }
}

#[cfg(test)]
mod tests {
    use super::HandlerValue;
    use super::INTERNAL_MARKER_PROPERTY;
    use super::PropertyValue;

    #[test]
    fn counts_property_kinds() {
        let handler = HandlerValue::function("function w(){}")
            .with_function_property("inner", HandlerValue::function("function(e){}"))
            .with_property("flag", PropertyValue::Boolean(false))
            .with_property("data", PropertyValue::Other);

        assert_eq!(handler.function_properties().count(), 1);
        assert_eq!(handler.boolean_property_count(), 1);
        assert!(handler.function_property("flag").is_none());
        assert!(handler.property("data").is_some_and(PropertyValue::is_truthy));
        assert!(!handler.property("flag").is_some_and(PropertyValue::is_truthy));
    }

    #[test]
    fn detects_internal_marker_and_bound_names() {
        let internal = HandlerValue::function("function(){}")
            .with_property(INTERNAL_MARKER_PROPERTY, PropertyValue::Boolean(true));
        assert!(internal.is_internal());

        let bound = HandlerValue::function("function () { [native code] }").named("bound onMsg");
        assert_eq!(bound.bound_name(), Some("bound onMsg"));
        assert!(bound.is_native_placeholder());
        assert!(!bound.is_internal());
    }
}
