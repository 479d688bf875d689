use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid manifest in {path}: {message}")]
    Invalid { path: String, message: String },

    #[error("duplicate fleet '{name}' defined in {path} and {other_path}")]
    Duplicate {
        name: String,
        path: String,
        other_path: String,
    },
}
