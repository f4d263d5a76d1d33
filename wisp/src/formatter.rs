use colored::*;
use wisp_core::{
    schema::{Field, FieldKind, MapValueType, Method, ParseWarning, Service},
    session::QueryResponse,
};

/// A wrapper struct for a formatted, colored string.
///
/// Implements `Display` so it can be printed directly.
pub struct FormattedString(pub String);

pub struct ServiceList<'a>(pub &'a [Service]);

/// The expanded input of a method.
pub struct MethodInput<'a>(pub &'a Method);

impl std::fmt::Display for FormattedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", self.0)?;
        Ok(())
    }
}

impl From<anyhow::Error> for FormattedString {
    fn from(err: anyhow::Error) -> Self {
        FormattedString(format!("{}\n\n'{:#}'", "Error:".red().bold(), err))
    }
}

impl From<&ParseWarning> for FormattedString {
    fn from(warning: &ParseWarning) -> Self {
        FormattedString(format!("{} {}", "Warning:".yellow().bold(), warning))
    }
}

impl From<&QueryResponse> for FormattedString {
    fn from(response: &QueryResponse) -> Self {
        let stats = format!(
            "sent={} received={} elapsed={}",
            response.sent,
            response.received,
            response.elapsed_text()
        )
        .dimmed();

        if let Some(error) = &response.error {
            return FormattedString(format!(
                "{} code={:?} message={:?}\n{}",
                "gRPC Failed:".red().bold(),
                error.code,
                error.message,
                stats
            ));
        }

        if response.end_of_stream {
            let trailers = response
                .trailer
                .iter()
                .map(|entry| match entry {
                    wisp_core::tonic::metadata::KeyAndValueRef::Ascii(key, value) => {
                        format!("  {}: {}", key.as_str().cyan(), value.to_str().unwrap_or("<binary>"))
                    }
                    wisp_core::tonic::metadata::KeyAndValueRef::Binary(key, _) => {
                        format!("  {}: <binary>", key.as_str().cyan())
                    }
                })
                .collect::<Vec<_>>();

            let mut out = format!("{}", "Stream finished".green().bold());
            if !trailers.is_empty() {
                out.push_str("\nTrailers:\n");
                out.push_str(&trailers.join("\n"));
            }
            out.push('\n');
            out.push_str(&stats.to_string());
            return FormattedString(out);
        }

        FormattedString(format!("{}\n{}", response.payload_json, stats))
    }
}

impl From<ServiceList<'_>> for FormattedString {
    fn from(ServiceList(services): ServiceList<'_>) -> Self {
        if services.is_empty() {
            return FormattedString("No services found.".yellow().to_string());
        }

        let mut out = String::new();
        out.push_str("Available Services:\n");
        for svc in services {
            out.push_str(&format!("  - {}\n", svc.name.green()));
            for method in &svc.methods {
                out.push_str(&format!(
                    "      {} {}\n",
                    method.name,
                    format!("({})", method.mode).dimmed()
                ));
            }
        }
        FormattedString(out.trim_end().to_string())
    }
}

impl From<MethodInput<'_>> for FormattedString {
    fn from(MethodInput(method): MethodInput<'_>) -> Self {
        let mut out = format!(
            "{} {}/{} {}\n",
            "rpc".cyan(),
            method.service_name().green(),
            method.name.green(),
            format!("({})", method.mode).dimmed()
        );

        if method.input_fields.is_empty() {
            out.push_str(&"  (no input fields)".dimmed().to_string());
        }
        for field in &method.input_fields {
            write_field(&mut out, field, 1);
        }

        FormattedString(out.trim_end().to_string())
    }
}

fn write_field(out: &mut String, field: &Field, depth: usize) {
    let indent = "  ".repeat(depth);
    let label = if field.repeated {
        format!("{} ", "repeated".cyan())
    } else {
        String::new()
    };
    let oneof = field
        .oneof
        .as_ref()
        .map(|group| format!(" {}", format!("[oneof {}]", group.name).dimmed()))
        .unwrap_or_default();

    out.push_str(&format!(
        "{indent}{label}{} {}{oneof}\n",
        type_label(&field.kind).yellow(),
        field.name
    ));

    match &field.kind {
        FieldKind::Message(message) => {
            for child in &message.fields {
                write_field(out, child, depth + 1);
            }
        }
        FieldKind::Map(map) if matches!(map.value, MapValueType::Message { .. }) => {
            for child in &map.value_fields {
                write_field(out, child, depth + 1);
            }
        }
        _ => {}
    }
}

fn type_label(kind: &FieldKind) -> String {
    match kind {
        FieldKind::Scalar(scalar) => scalar.to_string(),
        FieldKind::Enum(enum_type) => enum_type.type_name.clone(),
        FieldKind::Message(message) => message.type_name.clone(),
        FieldKind::Map(map) => {
            let value = match &map.value {
                MapValueType::Scalar(scalar) => scalar.to_string(),
                MapValueType::Enum(enum_type) => enum_type.type_name.clone(),
                MapValueType::Message { type_name } => type_name.clone(),
            };
            format!("map<{}, {}>", map.key, value)
        }
    }
}
