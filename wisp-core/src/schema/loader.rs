use super::{expand::FieldExpander, model::Method, model::Service};
use crate::{
    BoxError,
    config::Settings,
    reflection::client::{ReflectionClient, ReflectionResolveError},
};
use http_body::Body as HttpBody;
use miette::Diagnostic;
use prost_reflect::{DescriptorError, DescriptorPool};
use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use tonic::client::GrpcService;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Reflection request failed: '{0}'")]
    ReflectionResolve(#[from] ReflectionResolveError),

    #[error("Loading services using reflection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to build a descriptor pool: '{0}'")]
    Descriptor(#[from] DescriptorError),

    #[error("Failed to read the file descriptor set '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// A fatal `.proto` parse failure, with the position it was found at when known.
///
/// `line` and `column` are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ParseError {
    pub file: Option<String>,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line, self.column) {
            (Some(file), Some(line), Some(column)) => {
                write!(f, "{file}:{line}:{column}: {}", self.message)
            }
            (Some(file), _, _) => write!(f, "{file}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

impl ParseError {
    fn new(file: Option<String>, message: impl Into<String>) -> Self {
        Self {
            file,
            line: None,
            column: None,
            message: message.into(),
        }
    }

    fn from_protox(err: protox::Error) -> Self {
        let position = locate(&err, None);
        Self {
            file: err.file().map(str::to_string),
            line: position.map(|(line, _)| line),
            column: position.map(|(_, column)| column),
            message: err.to_string(),
        }
    }
}

/// Finds the 1-based position of the first labeled span of a diagnostic or its related ones.
fn locate(
    diagnostic: &dyn Diagnostic,
    inherited: Option<&dyn miette::SourceCode>,
) -> Option<(usize, usize)> {
    let source = diagnostic.source_code().or(inherited);

    if let (Some(source), Some(mut labels)) = (source, diagnostic.labels())
        && let Some(label) = labels.next()
        && let Ok(contents) = source.read_span(label.inner(), 0, 0)
    {
        return Some((contents.line() + 1, contents.column() + 1));
    }

    diagnostic
        .related()
        .into_iter()
        .flatten()
        .find_map(|related| locate(related, source))
}

/// A non-fatal finding of a `.proto` load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseWarning {
    MissingImportPath(PathBuf),
    NoServices(String),
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseWarning::MissingImportPath(path) => {
                write!(f, "import path '{}' does not exist", path.display())
            }
            ParseWarning::NoServices(file) => write!(f, "'{file}' does not define any service"),
        }
    }
}

/// The result of a successful `.proto` load.
#[derive(Debug, Clone)]
pub struct FileSchema {
    pub services: Vec<Service>,
    pub warnings: Vec<ParseWarning>,
}

/// Builds the [`Service`] model out of any of the supported descriptor sources.
#[derive(Debug, Clone, Copy)]
pub struct SchemaLoader {
    expander: FieldExpander,
    sort_methods: bool,
}

impl SchemaLoader {
    pub fn new(max_loop_depth: usize, sort_methods: bool) -> Self {
        Self {
            expander: FieldExpander::new(max_loop_depth),
            sort_methods,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.max_loop_depth, settings.sort_methods_by_name)
    }

    /// Extracts every service of `pool`, ordered with reflection services first.
    pub fn from_pool(&self, pool: &DescriptorPool) -> Vec<Service> {
        let services = pool
            .services()
            .map(|service| {
                let mut methods: Vec<Method> = service
                    .methods()
                    .map(|method| {
                        let input_fields = self.expander.expand_message(&method.input());
                        Method::new(method, input_fields)
                    })
                    .collect();

                if self.sort_methods {
                    methods.sort_by(|a, b| a.name.cmp(&b.name));
                }

                Service {
                    name: service.full_name().to_string(),
                    methods,
                }
            })
            .collect();

        sort_services(services)
    }

    /// Loads a compiled `FileDescriptorSet` (protobuf binary format).
    pub fn from_file_descriptor_set(&self, bytes: &[u8]) -> Result<Vec<Service>, LoadError> {
        let pool = DescriptorPool::decode(bytes)?;
        Ok(self.from_pool(&pool))
    }

    pub fn from_descriptor_set_file(&self, path: &Path) -> Result<Vec<Service>, LoadError> {
        let bytes = std::fs::read(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.from_file_descriptor_set(&bytes)
    }

    /// Asks the server for its services and resolves every one of them.
    ///
    /// The whole exchange is bounded by `timeout`. Failures are returned as they are: the
    /// caller decides whether reconnecting and trying again makes sense.
    pub async fn from_reflection<S>(
        &self,
        transport: S,
        timeout: Duration,
    ) -> Result<Vec<Service>, LoadError>
    where
        S: GrpcService<tonic::body::Body>,
        S::Error: Into<BoxError>,
        S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
        <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
    {
        let mut client = ReflectionClient::new(transport);

        let fd_set = tokio::time::timeout(timeout, async {
            let names = client.list_services().await?;
            client.file_descriptor_set_by_symbols(&names).await
        })
        .await
        .map_err(|_| LoadError::Timeout(timeout))??;

        let pool = DescriptorPool::from_file_descriptor_set(fd_set)?;
        Ok(self.from_pool(&pool))
    }

    /// Parses `.proto` sources.
    ///
    /// Every file is resolved against `import_paths`; files living outside all of them
    /// get their own directory added as an extra root.
    pub fn from_files(
        &self,
        proto_paths: &[PathBuf],
        import_paths: &[PathBuf],
    ) -> Result<FileSchema, ParseError> {
        let mut warnings = Vec::new();

        let mut includes: Vec<PathBuf> = Vec::new();
        for path in import_paths {
            if path.is_dir() {
                includes.push(path.clone());
            } else {
                warnings.push(ParseWarning::MissingImportPath(path.clone()));
            }
        }

        for path in proto_paths {
            let covered = includes.iter().any(|include| path.starts_with(include));
            if !covered && let Some(parent) = path.parent() {
                let parent = if parent.as_os_str().is_empty() {
                    PathBuf::from(".")
                } else {
                    parent.to_path_buf()
                };
                if !includes.contains(&parent) {
                    includes.push(parent);
                }
            }
        }

        let mut compiler = protox::Compiler::new(&includes).map_err(ParseError::from_protox)?;
        compiler.include_imports(true);

        for path in proto_paths {
            compiler.open_file(path).map_err(ParseError::from_protox)?;
        }

        let top_level: Vec<String> = compiler
            .files()
            .filter(|file| !file.is_import())
            .map(|file| file.name().to_string())
            .collect();

        // Two paths resolving to the same file collapse into one descriptor.
        if top_level.len() != proto_paths.len() {
            return Err(ParseError::new(
                None,
                format!(
                    "wrong parse result: expected {} file descriptors, got {}",
                    proto_paths.len(),
                    top_level.len()
                ),
            ));
        }

        let pool = compiler.descriptor_pool();

        for name in &top_level {
            let defines_services = pool
                .get_file_by_name(name)
                .is_some_and(|file| file.services().next().is_some());
            if !defines_services {
                warnings.push(ParseWarning::NoServices(name.clone()));
            }
        }

        // Only services declared in the requested files are exposed, not those of imports.
        let services = self
            .from_pool(&pool)
            .into_iter()
            .filter(|service| {
                pool.get_service_by_name(&service.name)
                    .is_some_and(|s| top_level.iter().any(|name| name == s.parent_file().name()))
            })
            .collect();

        Ok(FileSchema { services, warnings })
    }
}

fn sort_services(mut services: Vec<Service>) -> Vec<Service> {
    services.sort_by(|a, b| {
        b.is_reflection()
            .cmp(&a.is_reflection())
            .then_with(|| a.name.cmp(&b.name))
    });
    services
}
