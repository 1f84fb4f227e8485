//! Session configuration.

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Open a transaction implicitly when `commit()` finds none.
    pub auto_begin: bool,
    /// Validate dirty instances before serialization.
    pub validate: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            validate: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    pub fn validate(mut self, value: bool) -> Self {
        self.validate = value;
        self
    }
}
