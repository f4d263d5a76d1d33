use prost_reflect::{FieldDescriptor, Kind, MessageDescriptor, MethodDescriptor};
use std::fmt;

/// Prefix shared by every version of the server reflection service.
pub const REFLECTION_SERVICE_PREFIX: &str = "grpc.reflection.";

/// A gRPC service and its methods.
#[derive(Debug, Clone)]
pub struct Service {
    /// Fully qualified name (e.g. `my.package.Service`).
    pub name: String,
    pub methods: Vec<Method>,
}

impl Service {
    pub fn is_reflection(&self) -> bool {
        self.name.starts_with(REFLECTION_SERVICE_PREFIX)
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// The four shapes a gRPC call can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMode {
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

impl RpcMode {
    pub fn from_streaming(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => RpcMode::Unary,
            (true, false) => RpcMode::ClientStream,
            (false, true) => RpcMode::ServerStream,
            (true, true) => RpcMode::BidiStream,
        }
    }

    /// Whether calls of this shape accept more than one outbound message.
    pub fn is_client_streaming(self) -> bool {
        matches!(self, RpcMode::ClientStream | RpcMode::BidiStream)
    }

    pub fn is_server_streaming(self) -> bool {
        matches!(self, RpcMode::ServerStream | RpcMode::BidiStream)
    }
}

impl fmt::Display for RpcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RpcMode::Unary => "unary",
            RpcMode::ClientStream => "client-stream",
            RpcMode::ServerStream => "server-stream",
            RpcMode::BidiStream => "bidi-stream",
        };
        f.write_str(label)
    }
}

/// A method of a [`Service`].
///
/// The descriptor is only used to invoke the call; everything the engine needs to know
/// about the input is in [`Method::input_fields`].
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub mode: RpcMode,
    pub input_fields: Vec<Field>,
    descriptor: MethodDescriptor,
}

impl Method {
    pub(crate) fn new(descriptor: MethodDescriptor, input_fields: Vec<Field>) -> Self {
        Self {
            name: descriptor.name().to_string(),
            mode: RpcMode::from_streaming(
                descriptor.is_client_streaming(),
                descriptor.is_server_streaming(),
            ),
            input_fields,
            descriptor,
        }
    }

    pub fn input_fields(&self) -> &[Field] {
        &self.input_fields
    }

    pub fn is_client_streaming(&self) -> bool {
        self.mode.is_client_streaming()
    }

    pub fn is_server_streaming(&self) -> bool {
        self.mode.is_server_streaming()
    }

    /// Opaque handle into the descriptor pool the method was loaded from.
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    /// Fully qualified name of the owning service.
    pub fn service_name(&self) -> &str {
        self.descriptor.parent_service().full_name()
    }
}

/// Protobuf scalar types, each with its exact wire width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Double,
    Float,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Bool,
    String,
    Bytes,
}

impl ScalarType {
    /// Maps a descriptor kind to its scalar type, `None` for enums and messages.
    pub fn from_kind(kind: &Kind) -> Option<Self> {
        let scalar = match kind {
            Kind::Double => ScalarType::Double,
            Kind::Float => ScalarType::Float,
            Kind::Int32 => ScalarType::Int32,
            Kind::Int64 => ScalarType::Int64,
            Kind::Uint32 => ScalarType::Uint32,
            Kind::Uint64 => ScalarType::Uint64,
            Kind::Sint32 => ScalarType::Sint32,
            Kind::Sint64 => ScalarType::Sint64,
            Kind::Fixed32 => ScalarType::Fixed32,
            Kind::Fixed64 => ScalarType::Fixed64,
            Kind::Sfixed32 => ScalarType::Sfixed32,
            Kind::Sfixed64 => ScalarType::Sfixed64,
            Kind::Bool => ScalarType::Bool,
            Kind::String => ScalarType::String,
            Kind::Bytes => ScalarType::Bytes,
            Kind::Message(_) | Kind::Enum(_) => return None,
        };
        Some(scalar)
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarType::Double => "double",
            ScalarType::Float => "float",
            ScalarType::Int32 => "int32",
            ScalarType::Int64 => "int64",
            ScalarType::Uint32 => "uint32",
            ScalarType::Uint64 => "uint64",
            ScalarType::Sint32 => "sint32",
            ScalarType::Sint64 => "sint64",
            ScalarType::Fixed32 => "fixed32",
            ScalarType::Fixed64 => "fixed64",
            ScalarType::Sfixed32 => "sfixed32",
            ScalarType::Sfixed64 => "sfixed64",
            ScalarType::Bool => "bool",
            ScalarType::String => "string",
            ScalarType::Bytes => "bytes",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValue {
    pub name: String,
    pub number: i32,
}

/// An enum type. Enums always travel on the wire as `int32`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumType {
    pub type_name: String,
    pub values: Vec<EnumValue>,
}

impl EnumType {
    pub const UNDERLYING: ScalarType = ScalarType::Int32;

    pub fn number_of(&self, name: &str) -> Option<i32> {
        self.values.iter().find(|v| v.name == name).map(|v| v.number)
    }
}

#[derive(Debug, Clone)]
pub enum MapValueType {
    Scalar(ScalarType),
    Enum(EnumType),
    Message { type_name: String },
}

#[derive(Debug, Clone)]
pub struct MapType {
    pub key: ScalarType,
    pub value: MapValueType,
    /// Expanded fields of the value, populated only for message and enum values.
    pub value_fields: Vec<Field>,
    pub(crate) value_descriptor: FieldDescriptor,
}

#[derive(Debug, Clone)]
pub struct MessageType {
    pub name: String,
    pub type_name: String,
    pub fields: Vec<Field>,
    pub(crate) descriptor: MessageDescriptor,
}

impl MessageType {
    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.descriptor
    }
}

#[derive(Debug, Clone)]
pub enum FieldKind {
    Scalar(ScalarType),
    Enum(EnumType),
    Map(MapType),
    Message(MessageType),
}

impl FieldKind {
    pub fn type_name(&self) -> &str {
        match self {
            FieldKind::Scalar(scalar) => scalar.name(),
            FieldKind::Enum(_) => "enum",
            FieldKind::Map(_) => "map",
            FieldKind::Message(_) => "message",
        }
    }
}

/// The kind of field a nested field was expanded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentKind {
    Message,
    Map,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneofGroup {
    pub fqn: String,
    pub name: String,
}

/// A field of a message, expanded recursively.
///
/// `fqn` is unique within one expansion pass: repeated occurrences of a recursive field
/// carry an `[n]` suffix. `proto_fqn` is always the undecorated name, and it is the key
/// input records are looked up by.
#[derive(Debug, Clone)]
pub struct Field {
    pub fqn: String,
    pub proto_fqn: String,
    pub name: String,
    pub kind: FieldKind,
    pub parent: Option<ParentKind>,
    pub repeated: bool,
    pub oneof: Option<OneofGroup>,
    pub(crate) descriptor: Option<FieldDescriptor>,
}

impl Field {
    /// A synthetic field wrapping a bare scalar type, used to convert map keys.
    pub(crate) fn anonymous(scalar: ScalarType) -> Self {
        Self {
            fqn: String::new(),
            proto_fqn: String::new(),
            name: String::new(),
            kind: FieldKind::Scalar(scalar),
            parent: Some(ParentKind::Map),
            repeated: false,
            oneof: None,
            descriptor: None,
        }
    }

    pub fn descriptor(&self) -> Option<&FieldDescriptor> {
        self.descriptor.as_ref()
    }

    /// Greatest nesting depth of message fields below (and including) this one.
    pub fn message_depth(&self) -> usize {
        let children = match &self.kind {
            FieldKind::Message(message) => &message.fields,
            FieldKind::Map(map) => &map.value_fields,
            _ => return 0,
        };
        let nested = children.iter().map(Field::message_depth).max().unwrap_or(0);
        match self.kind {
            FieldKind::Message(_) => nested + 1,
            _ => nested,
        }
    }
}
