//! Script sources with change tracking.
//!
//! A [`ScriptSource`] describes where a script comes from and how the
//! runtime should interpret it. The prepared [`ScriptText`] is built lazily
//! and cached; any setter that actually changes the description drops the
//! cache and raises the "changed" flag, so a caller can tell when a cached
//! compiled form needs to be rebuilt.

use std::{fmt, fs, io, path::PathBuf, str::FromStr};

use hostscript_core::ScriptText;
use tracing::trace;

/// Language identifier of JavaScript sources.
pub const JAVASCRIPT_LANGUAGE: &str = "js";

/// MIME type marking a JavaScript source as an ECMAScript module.
pub const JAVASCRIPT_MODULE_MIME_TYPE: &str = "application/javascript+module";

/// Errors produced while preparing a script source.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SourceError {
    /// Language or origin has not been set.
    #[error("script source is not initialized: {0} is not set")]
    NotInitialized(&'static str),

    /// A file-resident script could not be read.
    #[error("cannot read script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where the text of a script comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOrigin {
    Literal(String),
    File(PathBuf),
}

/// Flavour of a JavaScript script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsFlavor {
    /// A classic script.
    Common,
    /// An ECMAScript module.
    Module,
}

impl JsFlavor {
    pub const ALL: [Self; 2] = [Self::Common, Self::Module];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Common => "common",
            Self::Module => "module",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|flavor| flavor.name() == name)
    }

    const fn mime_type(self) -> Option<&'static str> {
        match self {
            Self::Common => None,
            Self::Module => Some(JAVASCRIPT_MODULE_MIME_TYPE),
        }
    }
}

impl fmt::Display for JsFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JsFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown JavaScript flavour \"{s}\""))
    }
}

/// A mutable script description with a cached prepared form.
#[derive(Debug, Default)]
pub struct ScriptSource {
    language: Option<String>,
    origin: Option<SourceOrigin>,
    name: Option<String>,
    mime_type: Option<String>,
    changed: bool,
    cached: Option<ScriptText>,
}

impl ScriptSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a JavaScript source of the given flavour.
    pub fn set_js(
        &mut self,
        flavor: JsFlavor,
        origin: SourceOrigin,
        name: Option<&str>,
    ) -> &mut Self {
        self.set_language(JAVASCRIPT_LANGUAGE);
        self.set_origin(origin, name);
        self.set_mime_type(flavor.mime_type());
        self
    }

    /// Shorthand for a classic JavaScript literal.
    pub fn set_common_js(&mut self, script: impl Into<String>) -> &mut Self {
        self.set_js(JsFlavor::Common, SourceOrigin::Literal(script.into()), None)
    }

    /// Shorthand for a JavaScript module literal. Modules need a name to be
    /// importable from other modules.
    pub fn set_module_js(&mut self, script: impl Into<String>, name: &str) -> &mut Self {
        self.set_js(JsFlavor::Module, SourceOrigin::Literal(script.into()), Some(name))
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn set_language(&mut self, language: &str) -> &mut Self {
        if self.language.as_deref() != Some(language) {
            self.language = Some(language.to_string());
            self.invalidate();
        }
        self
    }

    pub fn origin(&self) -> Option<&SourceOrigin> {
        self.origin.as_ref()
    }

    /// Sets the origin and the name together.
    pub fn set_origin(&mut self, origin: SourceOrigin, name: Option<&str>) -> &mut Self {
        if self.origin.as_ref() != Some(&origin) {
            self.origin = Some(origin);
            self.invalidate();
        }
        self.set_name(name)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<&str>) -> &mut Self {
        if self.name.as_deref() != name {
            self.name = name.map(str::to_string);
            self.invalidate();
        }
        self
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    pub fn set_mime_type(&mut self, mime_type: Option<&str>) -> &mut Self {
        if self.mime_type.as_deref() != mime_type {
            self.mime_type = mime_type.map(str::to_string);
            self.invalidate();
        }
        self
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Returns the changed flag and clears it.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    /// The prepared script, built on first use.
    ///
    /// # Errors
    ///
    /// - [`SourceError::NotInitialized`] if language or origin is missing.
    /// - [`SourceError::Io`] if a file origin cannot be read.
    pub fn text(&mut self) -> Result<&ScriptText, SourceError> {
        let text = match self.cached.take() {
            Some(text) => text,
            None => {
                let text = self.build()?;
                trace!(language = %text.language, name = ?text.name, "Prepared script source");
                text
            }
        };
        Ok(self.cached.insert(text))
    }

    fn build(&self) -> Result<ScriptText, SourceError> {
        let language = self
            .language
            .as_deref()
            .ok_or(SourceError::NotInitialized("language"))?;
        let origin = self
            .origin
            .as_ref()
            .ok_or(SourceError::NotInitialized("origin"))?;
        let (text, default_name) = match origin {
            SourceOrigin::Literal(text) => (text.clone(), None),
            SourceOrigin::File(path) => {
                let text = fs::read_to_string(path).map_err(|source| SourceError::Io {
                    path: path.clone(),
                    source,
                })?;
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned());
                (text, file_name)
            }
        };
        Ok(ScriptText {
            language: language.to_string(),
            name: self.name.clone().or(default_name),
            mime_type: self.mime_type.clone(),
            text,
        })
    }

    fn invalidate(&mut self) {
        self.changed = true;
        self.cached = None;
    }
}
