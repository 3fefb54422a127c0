/*!
Archive name validation and placeholder substitution.

Names must not contain `/`. Templates may reference `{hostname}`,
`{fqdn}`, `{reverse-fqdn}`, `{now}`, `{utcnow}` (both with an optional
`:%format`), `{user}`, `{pid}`, `{version}`, `{major}` and
`{major_minor}`; literal braces are written `{{` and `}}`.
*/
use super::{ArchiveError, Result};

use chrono::prelude::*;

const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Checks an archive name for validity
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ArchiveError::InvalidName("name is empty".to_string()));
    }
    if name.contains('/') {
        return Err(ArchiveError::InvalidName(format!(
            "{}: archive names must not contain '/'",
            name
        )));
    }
    Ok(())
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn resolve(placeholder: &str) -> Result<String> {
    let (name, format) = match placeholder.find(':') {
        Some(at) => (&placeholder[..at], Some(&placeholder[at + 1..])),
        None => (placeholder, None),
    };
    let value = match name {
        "hostname" => {
            // The short name: everything before the first dot
            let full = local_hostname();
            full.split('.').next().unwrap_or(&full).to_string()
        }
        "fqdn" => local_hostname(),
        "reverse-fqdn" => {
            let full = local_hostname();
            full.split('.').rev().collect::<Vec<_>>().join(".")
        }
        "now" => Local::now()
            .format(format.unwrap_or(DEFAULT_TIME_FORMAT))
            .to_string(),
        "utcnow" => Utc::now()
            .format(format.unwrap_or(DEFAULT_TIME_FORMAT))
            .to_string(),
        "user" => std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "unknown".to_string()),
        "pid" => std::process::id().to_string(),
        "version" => crate::VERSION.to_string(),
        "major" => crate::VERSION_PIECES[0].to_string(),
        "major_minor" => format!("{}.{}", crate::VERSION_PIECES[0], crate::VERSION_PIECES[1]),
        unknown => {
            return Err(ArchiveError::InvalidName(format!(
                "unknown placeholder {{{}}}",
                unknown
            )))
        }
    };
    if format.is_some() && !matches!(name, "now" | "utcnow") {
        return Err(ArchiveError::InvalidName(format!(
            "placeholder {{{}}} takes no format",
            name
        )));
    }
    Ok(value)
}

/// Substitutes placeholders in an archive name template
pub fn substitute_placeholders(template: &str) -> Result<String> {
    let mut output = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                output.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                output.push('}');
            }
            '{' => {
                let mut placeholder = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    placeholder.push(inner);
                }
                if !closed {
                    return Err(ArchiveError::InvalidName(format!(
                        "{}: unterminated placeholder",
                        template
                    )));
                }
                output.push_str(&resolve(&placeholder)?);
            }
            '}' => {
                return Err(ArchiveError::InvalidName(format!(
                    "{}: stray '}}'",
                    template
                )))
            }
            other => output.push(other),
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(substitute_placeholders("nightly").unwrap(), "nightly");
    }

    #[test]
    fn escaped_braces() {
        assert_eq!(substitute_placeholders("a{{b}}c").unwrap(), "a{b}c");
    }

    #[test]
    fn hostname_and_pid_substitute() {
        let result = substitute_placeholders("{hostname}-{pid}").unwrap();
        assert!(result.contains('-'));
        assert!(!result.contains('{'));
        let pid = std::process::id().to_string();
        assert!(result.ends_with(&pid));
    }

    #[test]
    fn time_placeholders_accept_formats() {
        let result = substitute_placeholders("backup-{utcnow:%Y}").unwrap();
        let year = Utc::now().format("%Y").to_string();
        assert_eq!(result, format!("backup-{}", year));
    }

    #[test]
    fn unknown_placeholders_are_rejected() {
        assert!(substitute_placeholders("{flavor}").is_err());
        assert!(substitute_placeholders("{pid:%Y}").is_err());
        assert!(substitute_placeholders("{unterminated").is_err());
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("fine-name").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("not/fine").is_err());
    }
}
