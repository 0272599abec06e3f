//! Request authentication.
//!
//! Session and API-token verification happens in a middleware outside this
//! repository; by the time a request reaches us it is trusted. The only
//! thing extracted here is the tenant: the middleware forwards the caller's
//! organization in `X-Pulse-Org`, and that value becomes the request's auth
//! id, which the tenant resolver maps to the tenant state (falling back to
//! `default`).

use anyhow::format_err;

use proxmox_rest_server::AuthError;
use proxmox_router::UserInformation;

use pulse_api_types::DEFAULT_ORG_ID;

const ORG_HEADER: &str = "x-pulse-org";

/// Access to the long lived API tokens managed by the auth middleware.
///
/// Auto-registration accepts such a token in place of a one-time setup
/// code; this is the only check the control plane ever performs on them.
pub trait ApiTokenStore: Send + Sync {
    fn matches(&self, token: &str) -> bool;
}

/// Used when no middleware token store is attached.
pub struct NoApiTokens;

impl ApiTokenStore for NoApiTokens {
    fn matches(&self, _token: &str) -> bool {
        false
    }
}

struct TenantUser;

impl UserInformation for TenantUser {
    fn is_superuser(&self, _userid: &str) -> bool {
        true
    }

    fn is_group_member(&self, _userid: &str, _group: &str) -> bool {
        false
    }

    fn lookup_privs(&self, _userid: &str, _path: &[&str]) -> u64 {
        u64::MAX
    }
}

pub async fn check_auth(
    headers: &http::HeaderMap,
    _method: &hyper::Method,
) -> Result<(String, Box<dyn UserInformation + Sync + Send>), AuthError> {
    let org = match headers.get(ORG_HEADER) {
        Some(value) => {
            let org = value
                .to_str()
                .map_err(|_| AuthError::Generic(format_err!("bad {ORG_HEADER} header")))?;
            if org.is_empty() || !is_safe_org_id(org) {
                return Err(AuthError::Generic(format_err!(
                    "bad {ORG_HEADER} header value"
                )));
            }
            org.to_string()
        }
        None => DEFAULT_ORG_ID.to_string(),
    };

    Ok((org, Box::new(TenantUser)))
}

/// Org ids are used as directory names; restrict them accordingly.
fn is_safe_org_id(org: &str) -> bool {
    !org.starts_with('.')
        && org
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}
