use echo_service::{EchoServiceServer, FILE_DESCRIPTOR_SET, PROTO_DIR};
use echo_service_impl::EchoServiceImpl;
use std::{path::PathBuf, time::Duration};
use tonic::service::Routes;
use wisp_core::schema::{
    Field, FieldKind, MapValueType, ParseWarning, RpcMode, SchemaLoader, Service,
};


fn echo_service(services: &[Service]) -> &Service {
    services
        .iter()
        .find(|s| s.name == "echo.EchoService")
        .expect("echo.EchoService not loaded")
}

fn input_field<'a>(service: &'a Service, method: &str, name: &str) -> &'a Field {
    service
        .method(method)
        .expect("method not found")
        .input_fields()
        .iter()
        .find(|f| f.name == name)
        .expect("field not found")
}

#[test]
fn test_methods_are_sorted_by_name() {
    let services = SchemaLoader::new(10, true)
        .from_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .unwrap();
    let names: Vec<&str> = echo_service(&services)
        .methods
        .iter()
        .map(|m| m.name.as_str())
        .collect();

    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

#[test]
fn test_declaration_order_is_kept_without_sorting() {
    let services = SchemaLoader::new(10, false)
        .from_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .unwrap();
    let service = echo_service(&services);

    assert_eq!(service.methods[0].name, "UnaryEcho");
    assert_eq!(service.methods[0].mode, RpcMode::Unary);
    assert_eq!(
        service.method("ClientStreamingEcho").unwrap().mode,
        RpcMode::ClientStream
    );
    assert_eq!(
        service.method("ServerStreamingEcho").unwrap().mode,
        RpcMode::ServerStream
    );
    assert_eq!(
        service.method("BidirectionalEcho").unwrap().mode,
        RpcMode::BidiStream
    );
}

#[test]
fn test_recursive_message_is_bounded_by_loop_depth() {
    for depth in [1, 3, 10] {
        let services = SchemaLoader::new(depth, true)
            .from_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .unwrap();
        let children = input_field(echo_service(&services), "Plant", "children");

        assert_eq!(children.message_depth(), depth, "loop depth {depth}");
    }
}

#[test]
fn test_repeated_occurrences_are_decorated() {
    let services = SchemaLoader::new(3, true)
        .from_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .unwrap();
    let service = echo_service(&services);

    let label = input_field(service, "Plant", "label");
    assert_eq!(label.fqn, "echo.TreeNode.label");

    let children = input_field(service, "Plant", "children");
    assert!(children.repeated);
    let FieldKind::Message(message) = &children.kind else {
        panic!("Expected a message field");
    };
    assert_eq!(message.type_name, "echo.TreeNode");

    let nested_label = message.fields.iter().find(|f| f.name == "label").unwrap();
    assert_eq!(nested_label.fqn, "echo.TreeNode.label[0]");
    assert_eq!(nested_label.proto_fqn, "echo.TreeNode.label");
}

#[test]
fn test_maps_oneofs_and_enums_are_expanded() {
    let services = SchemaLoader::new(10, true)
        .from_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .unwrap();
    let service = echo_service(&services);

    let FieldKind::Map(points) = &input_field(service, "Mirror", "points").kind else {
        panic!("Expected a map field");
    };
    assert!(matches!(&points.value, MapValueType::Message { type_name } if type_name == "echo.Point"));
    let value_names: Vec<&str> = points.value_fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(value_names, ["x", "y"]);

    let FieldKind::Map(palette) = &input_field(service, "Mirror", "palette").kind else {
        panic!("Expected a map field");
    };
    assert!(matches!(&palette.value, MapValueType::Enum(e) if e.type_name == "echo.Color"));
    assert_eq!(palette.value_fields.len(), 1);

    let FieldKind::Map(tags) = &input_field(service, "Mirror", "tags").kind else {
        panic!("Expected a map field");
    };
    assert!(tags.value_fields.is_empty());

    for name in ["name", "id"] {
        let oneof = input_field(service, "Mirror", name).oneof.as_ref().unwrap();
        assert_eq!(oneof.name, "target");
    }
    assert!(input_field(service, "Mirror", "text").oneof.is_none());

    let FieldKind::Enum(color) = &input_field(service, "Mirror", "color").kind else {
        panic!("Expected an enum field");
    };
    assert_eq!(color.number_of("COLOR_GREEN"), Some(2));
}

#[test]
fn test_load_from_proto_files() {
    let proto_dir = PathBuf::from(PROTO_DIR);
    let schema = SchemaLoader::new(10, true)
        .from_files(&[proto_dir.join("echo.proto")], &[proto_dir])
        .unwrap();

    assert!(schema.warnings.is_empty());
    assert_eq!(schema.services.len(), 1);
    assert_eq!(echo_service(&schema.services).methods.len(), 8);
}

#[test]
fn test_proto_file_outside_import_paths_is_resolved() {
    let schema = SchemaLoader::new(10, true)
        .from_files(&[PathBuf::from(PROTO_DIR).join("echo.proto")], &[])
        .unwrap();

    assert!(echo_service(&schema.services).method("Mirror").is_some());
}

#[test]
fn test_parse_error_reports_position() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.proto");
    std::fs::write(
        &path,
        "syntax = \"proto3\";\n\nmessage Broken {\n  string name = 1\n}\n",
    )
    .unwrap();

    let err = SchemaLoader::new(10, true)
        .from_files(&[path], &[dir.path().to_path_buf()])
        .unwrap_err();

    assert_eq!(err.file.as_deref(), Some("broken.proto"));
    assert!(matches!(err.line, Some(4) | Some(5)), "line was {:?}", err.line);
    assert!(err.column.is_some());
    assert!(err.to_string().starts_with("broken.proto:"));
}

#[test]
fn test_warnings_do_not_fail_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("types.proto");
    std::fs::write(
        &path,
        "syntax = \"proto3\";\npackage types;\nmessage Only { string id = 1; }\n",
    )
    .unwrap();
    let missing = dir.path().join("does-not-exist");

    let schema = SchemaLoader::new(10, true)
        .from_files(&[path], &[dir.path().to_path_buf(), missing.clone()])
        .unwrap();

    assert!(schema.services.is_empty());
    assert!(schema.warnings.contains(&ParseWarning::MissingImportPath(missing)));
    assert!(
        schema
            .warnings
            .contains(&ParseWarning::NoServices("types.proto".to_string()))
    );
}

#[tokio::test]
async fn test_load_from_reflection() {
    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()
        .unwrap();
    let routes = Routes::new(reflection_service).add_service(EchoServiceServer::new(EchoServiceImpl));

    let services = SchemaLoader::new(10, true)
        .from_reflection(routes, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(services[0].is_reflection());
    assert_eq!(services[0].name, "grpc.reflection.v1.ServerReflection");
    assert_eq!(echo_service(&services).methods.len(), 8);
}

#[tokio::test]
async fn test_reflection_is_unsupported() {
    let server = EchoServiceServer::new(EchoServiceImpl);

    let result = SchemaLoader::new(10, true)
        .from_reflection(server, Duration::from_secs(5))
        .await;

    assert!(matches!(
        result,
        Err(wisp_core::schema::LoadError::ReflectionResolve(_))
    ));
}
