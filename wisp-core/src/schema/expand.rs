//! Eager, cycle-safe flattening of message descriptors into [`Field`] trees.
//!
//! Every time a message is expanded, each of its fields is "admitted" and a counter keyed
//! by the field's fully qualified name goes up. Once a field has been admitted
//! `max_loop_depth` times it is dropped, so a self-referential message such as
//!
//! ```proto
//! message TreeNode {
//!   string label = 1;
//!   repeated TreeNode children = 2;
//! }
//! ```
//!
//! expands to exactly `max_loop_depth` nested levels. A message left with no admitted
//! fields is omitted from its parent entirely.
//!
//! Counters are shared across one top-level field's whole subtree, and every top-level
//! field starts from scratch.
use super::model::{
    EnumType, EnumValue, Field, FieldKind, MapType, MapValueType, MessageType, OneofGroup,
    ParentKind, ScalarType,
};
use prost_reflect::{EnumDescriptor, FieldDescriptor, Kind, MessageDescriptor};
use std::collections::HashMap;

#[derive(Debug, Default)]
struct LoopCounter(HashMap<String, usize>);

impl LoopCounter {
    /// Keeps the fields that are still below the loop bound and counts them.
    fn admit(
        &mut self,
        fields: impl Iterator<Item = FieldDescriptor>,
        max_loop_depth: usize,
    ) -> Vec<FieldDescriptor> {
        fields
            .filter(|field| match self.0.get_mut(field.full_name()) {
                Some(count) if *count >= max_loop_depth => false,
                Some(count) => {
                    *count += 1;
                    true
                }
                None => {
                    self.0.insert(field.full_name().to_string(), 1);
                    true
                }
            })
            .collect()
    }

    /// Returns the decorated `fqn` and the canonical `proto_fqn` of a field.
    fn decorate(&self, field: &FieldDescriptor) -> (String, String) {
        let name = field.full_name();
        match self.0.get(name) {
            Some(&count) if count > 0 => (format!("{name}[{}]", count - 1), name.to_string()),
            _ => (name.to_string(), name.to_string()),
        }
    }
}

/// Expands message descriptors into [`Field`] trees, bounded by `max_loop_depth`.
#[derive(Debug, Clone, Copy)]
pub struct FieldExpander {
    max_loop_depth: usize,
}

impl FieldExpander {
    pub fn new(max_loop_depth: usize) -> Self {
        Self { max_loop_depth }
    }

    pub fn max_loop_depth(&self) -> usize {
        self.max_loop_depth
    }

    /// Expands every field of `message`.
    pub fn expand_message(&self, message: &MessageDescriptor) -> Vec<Field> {
        self.expand(message.fields().collect(), None, None)
    }

    fn expand(
        &self,
        descriptors: Vec<FieldDescriptor>,
        parent: Option<ParentKind>,
        mut counter: Option<&mut LoopCounter>,
    ) -> Vec<Field> {
        let mut fields = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let field = match counter.as_deref_mut() {
                Some(counter) => self.expand_field(descriptor, parent, counter),
                None => self.expand_field(descriptor, parent, &mut LoopCounter::default()),
            };
            fields.extend(field);
        }

        fields
    }

    fn expand_field(
        &self,
        descriptor: FieldDescriptor,
        parent: Option<ParentKind>,
        counter: &mut LoopCounter,
    ) -> Option<Field> {
        let (fqn, proto_fqn, kind) = match descriptor.kind() {
            Kind::Enum(enum_descriptor) => {
                let (fqn, proto_fqn) = counter.decorate(&descriptor);
                (fqn, proto_fqn, FieldKind::Enum(enum_type(&enum_descriptor)))
            }
            Kind::Message(entry) if descriptor.is_map() => {
                let (fqn, proto_fqn) = counter.decorate(&descriptor);
                let map = self.expand_map(&entry, counter)?;
                (fqn, proto_fqn, FieldKind::Map(map))
            }
            Kind::Message(message) => {
                let admitted = counter.admit(message.fields(), self.max_loop_depth);
                if admitted.is_empty() {
                    return None;
                }

                let (fqn, proto_fqn) = counter.decorate(&descriptor);
                let fields = self.expand(admitted, Some(ParentKind::Message), Some(&mut *counter));

                let message = MessageType {
                    name: message.name().to_string(),
                    type_name: message.full_name().to_string(),
                    fields,
                    descriptor: message,
                };
                (fqn, proto_fqn, FieldKind::Message(message))
            }
            other => {
                let (fqn, proto_fqn) = counter.decorate(&descriptor);
                (fqn, proto_fqn, FieldKind::Scalar(ScalarType::from_kind(&other)?))
            }
        };

        let oneof = descriptor
            .containing_oneof()
            .filter(|oneof| !oneof.is_synthetic())
            .map(|oneof| OneofGroup {
                fqn: oneof.full_name().to_string(),
                name: oneof.name().to_string(),
            });

        Some(Field {
            fqn,
            proto_fqn,
            name: descriptor.name().to_string(),
            kind,
            parent,
            repeated: descriptor.is_list(),
            oneof,
            descriptor: Some(descriptor),
        })
    }

    fn expand_map(&self, entry: &MessageDescriptor, counter: &mut LoopCounter) -> Option<MapType> {
        let key_field = entry.map_entry_key_field();
        let value_field = entry.map_entry_value_field();
        let key = ScalarType::from_kind(&key_field.kind())?;

        let (value, value_fields) = match value_field.kind() {
            Kind::Message(message) => {
                let admitted = counter.admit(message.fields(), self.max_loop_depth);
                if admitted.is_empty() {
                    return None;
                }

                let fields = self.expand(admitted, Some(ParentKind::Map), Some(&mut *counter));
                let value = MapValueType::Message {
                    type_name: message.full_name().to_string(),
                };
                (value, fields)
            }
            Kind::Enum(enum_descriptor) => {
                let fields = self.expand(
                    vec![value_field.clone()],
                    Some(ParentKind::Map),
                    Some(&mut *counter),
                );
                (MapValueType::Enum(enum_type(&enum_descriptor)), fields)
            }
            other => (MapValueType::Scalar(ScalarType::from_kind(&other)?), Vec::new()),
        };

        Some(MapType {
            key,
            value,
            value_fields,
            value_descriptor: value_field,
        })
    }
}

fn enum_type(descriptor: &EnumDescriptor) -> EnumType {
    EnumType {
        type_name: descriptor.full_name().to_string(),
        values: descriptor
            .values()
            .map(|value| EnumValue {
                name: value.name().to_string(),
                number: value.number(),
            })
            .collect(),
    }
}
