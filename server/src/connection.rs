//! Create API clients for monitored nodes
//!
//! Make sure to call [`init`] to inject a concrete [`ClientFactory`]
//! instance before calling any of the provided functions.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, format_err, Error};

use proxmox_client::{Client, TlsOptions};

use pulse_api_types::{NodeType, PbsInstance, PmgInstance, PveInstance};

use crate::normalize::host_part;
use crate::pbs_client::{PbsApiImpl, PbsClient};
use crate::pmg_client::{PmgApiImpl, PmgClient};
use crate::pve_client::{PveApiImpl, PveClient};

static INSTANCE: OnceLock<Box<dyn ClientFactory + Send + Sync>> = OnceLock::new();

/// Default timeout for ordinary API calls against a node.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to build an authenticated client for one node.
///
/// Built from an inventory entry (or from user supplied, not yet persisted
/// data for the `test` endpoints) and handed to the [`ClientFactory`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub ty: NodeType,
    /// Normalized `scheme://host:port` URL.
    pub host: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token_name: Option<String>,
    pub token_value: Option<String>,
    pub fingerprint: Option<String>,
    pub verify_ssl: Option<bool>,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn from_pve(pve: &PveInstance) -> Self {
        Self {
            ty: NodeType::Pve,
            host: pve.host.clone(),
            user: pve.user.clone(),
            password: pve.password.clone(),
            token_name: pve.token_name.clone(),
            token_value: pve.token_value.clone(),
            fingerprint: pve.fingerprint.clone(),
            verify_ssl: pve.verify_ssl,
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    pub fn from_pbs(pbs: &PbsInstance) -> Self {
        Self {
            ty: NodeType::Pbs,
            host: pbs.host.clone(),
            user: pbs.user.clone(),
            password: pbs.password.clone(),
            token_name: pbs.token_name.clone(),
            token_value: pbs.token_value.clone(),
            fingerprint: pbs.fingerprint.clone(),
            verify_ssl: pbs.verify_ssl,
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    pub fn from_pmg(pmg: &PmgInstance) -> Self {
        Self {
            ty: NodeType::Pmg,
            host: pmg.host.clone(),
            user: pmg.user.clone(),
            password: pmg.password.clone(),
            token_name: pmg.token_name.clone(),
            token_value: pmg.token_value.clone(),
            fingerprint: pmg.fingerprint.clone(),
            verify_ssl: pmg.verify_ssl,
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    /// Same credentials, but pointed at a cluster peer.
    ///
    /// Scheme and port are re-derived from the base host; the peer address
    /// replaces the host part.
    pub fn for_peer(&self, peer: &str) -> Self {
        let (scheme, rest) = self
            .host
            .split_once("://")
            .unwrap_or(("https", self.host.as_str()));
        let port = rest
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
            .unwrap_or_else(|| self.ty.default_port());

        let host = if peer.contains(':') && !peer.starts_with('[') {
            format!("{scheme}://[{peer}]:{port}")
        } else {
            format!("{scheme}://{peer}:{port}")
        };

        let mut this = self.clone();
        this.host = host;
        // the pinned fingerprint belongs to the node we were configured for
        this.fingerprint = None;
        this
    }

    /// Relax TLS verification; used during cluster discovery only.
    pub fn insecure(mut self) -> Self {
        self.fingerprint = None;
        self.verify_ssl = Some(false);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The bare host (no scheme/port) of this config.
    pub fn host_part(&self) -> &str {
        host_part(&self.host)
    }

    fn token_prefix(&self) -> (String, bool) {
        match self.ty {
            NodeType::Pve => ("PVEAPIToken".to_string(), true),
            NodeType::Pbs => ("PBSAPIToken".to_string(), false),
            NodeType::Pmg => ("PMGAPIToken".to_string(), true),
        }
    }
}

/// Returns a [`proxmox_client::Client`] prepared according to the config's
/// TLS settings, without authentication set.
fn prepare_connect_client(config: &ClientConfig) -> Result<Client, Error> {
    let mut options = TlsOptions::default();

    if let Some(fp) = &config.fingerprint {
        options = TlsOptions::parse_fingerprint(fp)?;
    } else if config.verify_ssl == Some(false) {
        options = TlsOptions::Callback(Box::new(|_valid, _store| true));
    }

    let uri: http::uri::Uri = config.host.parse()?;

    let client = Client::with_options(uri, options, Default::default())?;
    Ok(client)
}

/// Constructs a [`Client`] with token authentication set up.
fn connect(config: &ClientConfig) -> Result<Client, Error> {
    let token_name = config
        .token_name
        .as_deref()
        .ok_or_else(|| format_err!("no token configured"))?;
    let token_value = config.token_value.as_deref().unwrap_or_default();

    let (prefix, perl_compat) = config.token_prefix();

    let client = prepare_connect_client(config)?;
    client.set_authentication(proxmox_client::Token {
        userid: token_name.to_string(),
        value: token_value.to_string(),
        prefix,
        perl_compat,
    });
    Ok(client)
}

/// Constructs a [`Client`] for an API token or user.
///
/// In case the config has a user and password (instead of an API token), it
/// will connect and get a ticket, so that further requests are properly
/// authenticated.
///
/// Note: does not support two factor authentication.
async fn connect_or_login(config: &ClientConfig) -> Result<Client, Error> {
    if config.token_value.as_deref().is_some_and(|t| !t.is_empty()) {
        return connect(config);
    }

    let user = config
        .user
        .as_deref()
        .ok_or_else(|| format_err!("no credentials configured"))?;
    let password = config.password.as_deref().unwrap_or_default();

    let client = prepare_connect_client(config)?;
    match client
        .login(proxmox_login::Login::new(
            client.api_url().to_string(),
            user.to_string(),
            password.to_string(),
        ))
        .await
    {
        Ok(Some(_)) => bail!("two factor auth not supported"),
        Ok(None) => {}
        Err(err) => match err {
            proxmox_client::Error::Api(code, _) if code.as_u16() == 401 => {
                bail!("authentication failed")
            }
            proxmox_client::Error::Authentication(_) => {
                bail!("authentication failed")
            }
            _ => return Err(err.into()),
        },
    }
    Ok(client)
}

/// Abstract factory for creating node clients.
#[async_trait::async_trait]
pub trait ClientFactory {
    /// Create a new API client for a PVE node.
    fn make_pve_client(&self, config: &ClientConfig) -> Result<Box<PveClient>, Error>;

    /// Create a new API client for a PBS instance.
    fn make_pbs_client(&self, config: &ClientConfig) -> Result<Box<PbsClient>, Error>;

    /// Create a new API client for a PMG instance.
    fn make_pmg_client(&self, config: &ClientConfig) -> Result<Box<PmgClient>, Error>;

    /// Create a new API client for a PVE node, logging in with a ticket when
    /// the config carries a user instead of a token.
    async fn make_pve_client_and_login(
        &self,
        config: &ClientConfig,
    ) -> Result<Box<PveClient>, Error>;

    /// Create a new API client for a PBS instance, logging in with a ticket
    /// when the config carries a user instead of a token.
    async fn make_pbs_client_and_login(
        &self,
        config: &ClientConfig,
    ) -> Result<Box<PbsClient>, Error>;

    /// Create a new API client for a PMG instance, logging in with a ticket
    /// when the config carries a user instead of a token.
    async fn make_pmg_client_and_login(
        &self,
        config: &ClientConfig,
    ) -> Result<Box<PmgClient>, Error>;

    /// Capture the TLS fingerprint of an endpoint for TOFU pinning.
    async fn fetch_fingerprint(&self, host: &str, port: u16) -> Result<String, Error> {
        crate::fingerprint::fetch_fingerprint(host, port, Duration::from_secs(2)).await
    }
}

/// Default production client factory
pub struct DefaultClientFactory;

#[async_trait::async_trait]
impl ClientFactory for DefaultClientFactory {
    fn make_pve_client(&self, config: &ClientConfig) -> Result<Box<PveClient>, Error> {
        Ok(Box::new(PveApiImpl(connect(config)?)))
    }

    fn make_pbs_client(&self, config: &ClientConfig) -> Result<Box<PbsClient>, Error> {
        Ok(Box::new(PbsApiImpl(connect(config)?)))
    }

    fn make_pmg_client(&self, config: &ClientConfig) -> Result<Box<PmgClient>, Error> {
        Ok(Box::new(PmgApiImpl(connect(config)?)))
    }

    async fn make_pve_client_and_login(
        &self,
        config: &ClientConfig,
    ) -> Result<Box<PveClient>, Error> {
        Ok(Box::new(PveApiImpl(connect_or_login(config).await?)))
    }

    async fn make_pbs_client_and_login(
        &self,
        config: &ClientConfig,
    ) -> Result<Box<PbsClient>, Error> {
        Ok(Box::new(PbsApiImpl(connect_or_login(config).await?)))
    }

    async fn make_pmg_client_and_login(
        &self,
        config: &ClientConfig,
    ) -> Result<Box<PmgClient>, Error> {
        Ok(Box::new(PmgApiImpl(connect_or_login(config).await?)))
    }
}

pub(crate) fn factory() -> &'static (dyn ClientFactory + Send + Sync) {
    // Not initializing the connection factory instance is
    // entirely in our responsibility and not something we can recover from,
    // so it should be okay to panic in this case.
    INSTANCE
        .get()
        .expect("client factory instance not set")
        .as_ref()
}

/// Create a new API client for a PVE node.
pub fn make_pve_client(config: &ClientConfig) -> Result<Box<PveClient>, Error> {
    factory().make_pve_client(config)
}

/// Create a new API client for a PBS instance.
pub fn make_pbs_client(config: &ClientConfig) -> Result<Box<PbsClient>, Error> {
    factory().make_pbs_client(config)
}

/// Create a new API client for a PMG instance.
pub fn make_pmg_client(config: &ClientConfig) -> Result<Box<PmgClient>, Error> {
    factory().make_pmg_client(config)
}

/// Create a new API client for a PVE node, with ticket login support.
pub async fn make_pve_client_and_login(config: &ClientConfig) -> Result<Box<PveClient>, Error> {
    factory().make_pve_client_and_login(config).await
}

/// Create a new API client for a PBS instance, with ticket login support.
pub async fn make_pbs_client_and_login(config: &ClientConfig) -> Result<Box<PbsClient>, Error> {
    factory().make_pbs_client_and_login(config).await
}

/// Create a new API client for a PMG instance, with ticket login support.
pub async fn make_pmg_client_and_login(config: &ClientConfig) -> Result<Box<PmgClient>, Error> {
    factory().make_pmg_client_and_login(config).await
}

/// Initialize the [`ClientFactory`] instance.
///
/// Will panic if the instance has already been set.
pub fn init(instance: Box<dyn ClientFactory + Send + Sync>) {
    if INSTANCE.set(instance).is_err() {
        panic!("connection factory instance already set");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ClientConfig {
        ClientConfig {
            ty: NodeType::Pve,
            host: "https://10.0.0.5:8006".to_string(),
            user: None,
            password: None,
            token_name: Some("monitor@pam!pulse".to_string()),
            token_value: Some("secret".to_string()),
            fingerprint: Some("aa:bb".to_string()),
            verify_ssl: None,
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    #[test]
    fn peer_config_rederives_scheme_and_port() {
        let config = test_config();

        let peer = config.for_peer("10.0.0.7");
        assert_eq!(peer.host, "https://10.0.0.7:8006");
        assert_eq!(peer.fingerprint, None);

        let v6 = config.for_peer("fd00::7");
        assert_eq!(v6.host, "https://[fd00::7]:8006");
    }

    #[test]
    fn insecure_drops_pinning() {
        let config = test_config().insecure();
        assert_eq!(config.fingerprint, None);
        assert_eq!(config.verify_ssl, Some(false));
    }
}
