use serde::{Deserialize, Serialize};

/// A job parameter as defined on the subscriber's side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(default, alias = "default")]
    pub default_value: String,
}

impl ParameterDefinition {
    pub fn new(name: impl Into<String>, default_value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_value: default_value.into(),
        }
    }
}

/// A registered job interested in build-trigger messages for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    /// Unique registry key.
    pub project: String,
    /// Shared secret; `None` means the subscriber can never be matched.
    pub auth_token: Option<String>,
    pub parameters: Vec<ParameterDefinition>,
}

impl Subscriber {
    /// Create a subscriber, normalizing the token: surrounding whitespace is
    /// stripped and a blank token becomes `None`.
    pub fn new(
        project: impl Into<String>,
        auth_token: Option<&str>,
        parameters: Vec<ParameterDefinition>,
    ) -> Self {
        Self {
            project: project.into(),
            auth_token: normalize_token(auth_token),
            parameters,
        }
    }

    pub fn has_token(&self) -> bool {
        self.auth_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

fn normalize_token(token: Option<&str>) -> Option<String> {
    token.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string)
}
