use super::handlers::{auth, health, me, recovery, MessageResponse};
use crate::security::Role;
use utoipa::openapi::{Contact, InfoBuilder, License};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        auth::login_student,
        auth::login_fa,
        auth::admin_login,
        auth::refresh,
        auth::admin_refresh,
        auth::logout,
        auth::admin_logout,
        recovery::forgot_password,
        me::me,
    ),
    components(schemas(
        health::Health,
        auth::LoginBody,
        auth::SessionResponse,
        recovery::ForgotPasswordRequest,
        MessageResponse,
        Role,
    )),
    tags(
        (name = "auth", description = "Login, session refresh, logout and password recovery"),
        (name = "health", description = "Service health"),
    )
)]
struct ApiDoc;

/// `OpenAPI` document with its info block taken from Cargo metadata.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();

    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();
    info.contact = cargo_contact();
    info.license = cargo_license();
    doc.info = info;

    doc
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let primary = env!("CARGO_PKG_AUTHORS").split(';').next().map(str::trim)?;
    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    Some(value.trim()).filter(|value| !value.is_empty())
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    let (name, email) = match author.split_once('<') {
        Some((name, rest)) => (name, rest.trim_end_matches('>')),
        None => (author, ""),
    };
    let name = Some(name.trim()).filter(|value| !value.is_empty());
    let email = Some(email.trim()).filter(|value| !value.is_empty());
    (name, email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_from_cargo() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));

        let contact = spec.info.contact.unwrap_or_default();
        assert_eq!(contact.name.as_deref(), Some("Team Gardisto"));
        assert_eq!(contact.email.as_deref(), Some("team@gardisto.dev"));

        let license = spec.info.license.map(|license| license.name);
        assert_eq!(license.as_deref(), Some("BSD-3-Clause"));
    }

    #[test]
    fn documents_gate_routes() {
        let spec = openapi();
        for path in [
            "/health",
            "/api/auth/login-student",
            "/api/auth/login-fa",
            "/admin/login",
            "/api/auth/refresh",
            "/admin/logout",
            "/admin/forgot-password",
            "/api/auth/me",
        ] {
            assert!(spec.paths.paths.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn author_parsing() {
        assert_eq!(
            parse_author("Jane Doe <jane@example.com>"),
            (Some("Jane Doe"), Some("jane@example.com"))
        );
        assert_eq!(parse_author("Jane Doe"), (Some("Jane Doe"), None));
        assert_eq!(parse_author("<a@b.c>"), (None, Some("a@b.c")));
    }
}
