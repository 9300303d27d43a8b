use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    Zip,
}

impl ArchiveType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Zip => "zip",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }

    pub fn infer_from_file_name(file_name: &str) -> Option<Self> {
        let file_name = Path::new(file_name.trim())
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("");
        let (stem, extension) = file_name.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        Self::parse(extension)
    }
}
