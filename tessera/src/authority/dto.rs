//! DTOs for the login and refresh endpoints

use serde::{Deserialize, Serialize};

use crate::{claims::Role, AccessToken, Password, RefreshToken, RefreshTokenRef, Subject};

/// Credentials collected by the login form
#[derive(Debug, Serialize)]
pub struct LoginRequest {
    /// The account's e-mail address
    pub email: String,
    /// The account's password
    pub password: Password,
}

/// A successful login reply
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginGrant {
    /// The issued access token
    pub access_token: AccessToken,
    /// The issued refresh token
    pub refresh_token: RefreshToken,
    /// The authenticated subject
    pub subject: Subject,
    /// The subject's primary role
    pub role: Role,
    /// Any further roles granted
    #[serde(default)]
    pub roles: Vec<Role>,
    /// The name to show in the application chrome, when the server offers
    /// one
    #[serde(default)]
    pub display_name: Option<String>,
}

/// The body of a refresh request
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    /// The refresh token being exchanged
    pub refresh_token: &'a RefreshTokenRef,
}

/// A successful refresh reply
///
/// The refresh token rotates: the reply always carries the pair to use from
/// now on.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    /// The renewed access token
    pub access_token: AccessToken,
    /// The refresh token to use next time
    pub refresh_token: RefreshToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_grant_parses_the_wire_shape() {
        let raw = r#"{
            "accessToken": "at",
            "refreshToken": "rt",
            "subject": "doctor-5",
            "role": "doctor",
            "roles": ["doctor", "administrator"]
        }"#;

        let grant: LoginGrant = serde_json::from_str(raw).unwrap();
        assert_eq!(grant.subject.as_str(), "doctor-5");
        assert_eq!(grant.role, Role::Doctor);
        assert_eq!(grant.roles, vec![Role::Doctor, Role::Administrator]);
        assert_eq!(grant.display_name, None);
    }

    #[test]
    fn refresh_request_serializes_camel_case() {
        let token = RefreshToken::from_static("rt-1");
        let body = serde_json::to_value(RefreshRequest {
            refresh_token: &token,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"refreshToken": "rt-1"}));
    }
}
