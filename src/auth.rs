use std::fmt;

/// Bearer token used to authenticate against the build server.
///
/// `Debug` output is redacted so tokens never end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_is_redacted() {
        let token = Token::from("eyJ0eXAiOiAiVENWMiJ9.secret");
        assert_eq!(format!("{token:?}"), "Token(***)");
        assert_eq!(token.as_str(), "eyJ0eXAiOiAiVENWMiJ9.secret");
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        let token = Token::from(String::from("  abc\n"));
        assert_eq!(token.as_str(), "abc");
    }
}
