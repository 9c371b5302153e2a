//! Address and template validation for the queueing API.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ValidationError;
use crate::template::TemplateRenderer;

static LOCAL_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+)*|"(?:[^"\\]|\\.)*")$"#)
        .expect("local-part pattern compiles")
});

static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:localhost|(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z0-9-]{2,63}|\[[0-9A-Fa-f:.]+\])$")
        .expect("domain pattern compiles")
});

/// Whether `addr` is a bare `local@domain` address.
pub fn is_valid_address(addr: &str) -> bool {
    let Some((local, domain)) = addr.rsplit_once('@') else {
        return false;
    };
    LOCAL_PART.is_match(local) && DOMAIN.is_match(domain)
}

/// Validate `a@b` or `Name <a@b>`.
pub fn validate_email_with_name(value: &str, field: &str) -> Result<(), ValidationError> {
    let value = value.trim();
    let addr = match (value.rfind('<'), value.ends_with('>')) {
        (Some(open), true) => &value[open + 1..value.len() - 1],
        _ => value,
    };
    if is_valid_address(addr.trim()) {
        Ok(())
    } else {
        Err(ValidationError::InvalidAddress {
            field: field.to_string(),
            value: value.to_string(),
        })
    }
}

/// Validate every entry of an address list, trimming whitespace and dropping blanks.
pub fn parse_emails(values: &[String], field: &str) -> Result<Vec<String>, ValidationError> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| validate_email_with_name(v, field).map(|()| v.to_string()))
        .collect()
}

/// Reject template sources the renderer cannot parse.
pub fn validate_template_syntax(renderer: &dyn TemplateRenderer, source: &str) -> Result<(), ValidationError> {
    renderer
        .check_syntax(source)
        .map_err(|e| ValidationError::NotAllowed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::SimpleRenderer;

    #[test]
    fn accepts_bare_and_named_addresses() {
        assert!(validate_email_with_name("a@example.com", "to").is_ok());
        assert!(validate_email_with_name("Alice Smith <alice@example.com>", "to").is_ok());
        assert!(validate_email_with_name("\"Smith, A\" <a.smith@mail.example.org>", "to").is_ok());
        assert!(validate_email_with_name("root@localhost", "to").is_ok());
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["", "plainaddress", "a@", "@example.com", "a b@example.com", "Name <broken>"] {
            let err = validate_email_with_name(bad, "sender").unwrap_err();
            assert!(matches!(err, ValidationError::InvalidAddress { .. }), "{bad}");
        }
    }

    #[test]
    fn parse_emails_drops_blanks_and_fails_on_bad_entry() {
        let list = vec![" a@example.com ".to_string(), String::new()];
        assert_eq!(parse_emails(&list, "to").unwrap(), vec!["a@example.com"]);

        let list = vec!["a@example.com".to_string(), "nope".to_string()];
        assert!(parse_emails(&list, "cc").is_err());
    }

    #[test]
    fn template_syntax_is_checked() {
        let renderer = SimpleRenderer::default();
        assert!(validate_template_syntax(&renderer, "Hi {{ name }}").is_ok());
        assert!(validate_template_syntax(&renderer, "Hi {{ name").is_err());
    }
}
