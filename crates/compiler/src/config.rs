//! Compiler configuration
//!
//! [`CompilerOptions`] carries the program-wide switches the CLI and the
//! `bq.toml` project file can set. OPTION statements in the source override
//! these defaults during semantic analysis.
//!
//! # Example
//!
//! ```rust,ignore
//! use bqc::CompilerOptions;
//!
//! let opts = CompilerOptions::new()
//!     .with_array_base(1)
//!     .with_option_explicit();
//! let il = bqc::compile_to_il(source, &opts)?;
//! ```

use serde::Deserialize;
use std::path::PathBuf;

use crate::symbols::StringMode;

/// Program-wide compiler switches.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Default array lower bound (0 or 1)
    pub array_base: i64,
    /// String literal handling: ASCII, UTF32, or per-literal auto-detection
    pub string_mode: StringMode,
    /// Require DIM before use
    pub option_explicit: bool,
    /// AND / OR / XOR semantics: bitwise (default) or normalized logical
    pub bitwise_ops: bool,
    /// Stop after writing the QBE IL file
    pub emit_il_only: bool,
    /// Keep the intermediate `.ssa` file after native compilation
    pub keep_il: bool,
    /// Additional library search paths passed to the system linker
    pub library_paths: Vec<String>,
    /// Additional libraries passed to the system linker
    pub libraries: Vec<String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            array_base: 0,
            string_mode: StringMode::Auto,
            option_explicit: false,
            bitwise_ops: true,
            emit_il_only: false,
            keep_il: false,
            library_paths: Vec::new(),
            libraries: Vec::new(),
        }
    }
}

impl CompilerOptions {
    pub fn new() -> Self {
        CompilerOptions::default()
    }

    pub fn with_array_base(mut self, base: i64) -> Self {
        self.array_base = base;
        self
    }

    pub fn with_string_mode(mut self, mode: StringMode) -> Self {
        self.string_mode = mode;
        self
    }

    pub fn with_option_explicit(mut self) -> Self {
        self.option_explicit = true;
        self
    }

    pub fn with_library(mut self, lib: impl Into<String>) -> Self {
        self.libraries.push(lib.into());
        self
    }

    pub fn with_library_path(mut self, path: impl Into<String>) -> Self {
        self.library_paths.push(path.into());
        self
    }
}

/// `bq.toml` project file, merged underneath CLI flags.
///
/// ```toml
/// [build]
/// array-base = 1
/// string-mode = "auto"
/// option-explicit = true
/// libraries = ["m"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub build: BuildSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildSection {
    pub array_base: Option<i64>,
    pub string_mode: Option<String>,
    pub option_explicit: Option<bool>,
    #[serde(default)]
    pub libraries: Vec<String>,
    #[serde(default)]
    pub library_paths: Vec<String>,
}

impl ProjectConfig {
    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("bad bq.toml: {}", e))
    }

    /// Locate `bq.toml` next to the source file, if present.
    pub fn discover(source_path: &std::path::Path) -> Option<PathBuf> {
        let dir = source_path.parent()?;
        let candidate = dir.join("bq.toml");
        candidate.exists().then_some(candidate)
    }

    /// Fold this project file into `options`. CLI-provided values win, so the
    /// caller applies the file first and the flags afterwards.
    pub fn apply(&self, options: &mut CompilerOptions) -> Result<(), String> {
        if let Some(base) = self.build.array_base {
            if base != 0 && base != 1 {
                return Err(format!("array-base must be 0 or 1, got {}", base));
            }
            options.array_base = base;
        }
        if let Some(mode) = &self.build.string_mode {
            options.string_mode = match mode.as_str() {
                "ascii" => StringMode::Ascii,
                "utf32" => StringMode::Utf32,
                "auto" => StringMode::Auto,
                other => return Err(format!("unknown string-mode '{}'", other)),
            };
        }
        if let Some(explicit) = self.build.option_explicit {
            options.option_explicit = explicit;
        }
        options.libraries.extend(self.build.libraries.iter().cloned());
        options
            .library_paths
            .extend(self.build.library_paths.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let opts = CompilerOptions::new()
            .with_array_base(1)
            .with_option_explicit()
            .with_library("m");
        assert_eq!(opts.array_base, 1);
        assert!(opts.option_explicit);
        assert_eq!(opts.libraries, vec!["m"]);
    }

    #[test]
    fn test_project_config_apply() {
        let config = ProjectConfig::from_toml(
            "[build]\narray-base = 1\nstring-mode = \"utf32\"\noption-explicit = true\nlibraries = [\"m\"]\n",
        )
        .unwrap();
        let mut opts = CompilerOptions::default();
        config.apply(&mut opts).unwrap();
        assert_eq!(opts.array_base, 1);
        assert_eq!(opts.string_mode, StringMode::Utf32);
        assert!(opts.option_explicit);
        assert_eq!(opts.libraries, vec!["m"]);
    }

    #[test]
    fn test_project_config_rejects_bad_base() {
        let config = ProjectConfig::from_toml("[build]\narray-base = 2\n").unwrap();
        let mut opts = CompilerOptions::default();
        assert!(config.apply(&mut opts).is_err());
    }

    #[test]
    fn test_empty_project_config() {
        let config = ProjectConfig::from_toml("").unwrap();
        let mut opts = CompilerOptions::default();
        config.apply(&mut opts).unwrap();
        assert_eq!(opts.array_base, 0);
    }
}
