//! Device identity and request signing.
//!
//! The identity is resolved once per process and cached for its lifetime.
//! If resolution fails, a timestamp-based fallback is used for that
//! connection and resolution is attempted again next time.

use crate::{CacheError, CacheResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cache_protocol_types::NetworkAddresses;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::net::UdpSocket;
use std::pin::Pin;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Boxed future returned by [`IdentityProvider::resolve`].
pub type IdentityFuture<'a> = Pin<Box<dyn Future<Output = CacheResult<Identity>> + Send + 'a>>;

/// Opaque client identity sent with `authenticate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub fingerprint: String,
    pub addresses: NetworkAddresses,
}

/// Source of the device identity.
pub trait IdentityProvider: Send + Sync + 'static {
    fn resolve(&self) -> IdentityFuture<'_>;
}

static IDENTITY: OnceCell<Identity> = OnceCell::const_new();

/// The process-wide identity, resolving it through `provider` on first use.
pub async fn process_identity(provider: &dyn IdentityProvider) -> Identity {
    match IDENTITY.get_or_try_init(|| provider.resolve()).await {
        Ok(identity) => identity.clone(),
        Err(e) => {
            warn!(error = %e, "Identity resolution failed, using fallback");
            fallback_identity()
        }
    }
}

/// The cached identity, if it has been resolved.
pub fn cached_identity() -> Option<Identity> {
    IDENTITY.get().cloned()
}

fn fallback_identity() -> Identity {
    Identity {
        fingerprint: chrono::Utc::now().timestamp_millis().to_string(),
        addresses: NetworkAddresses::loopback(),
    }
}

/// `base64(HMAC-SHA256(secret, key))`.
pub fn sign_key(key: &str, secret: &str) -> CacheResult<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| CacheError::Identity(e.to_string()))?;
    mac.update(key.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Hex SHA-256 of the machine serial joined with the process id.
pub fn fingerprint_for(serial: &str, pid: u32) -> String {
    let digest = Sha256::digest(format!("{}{}", serial, pid).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Identity derived from the local machine.
///
/// The serial is the systemd/dbus machine id when present, else the
/// hostname. The private address is the interface the OS would route
/// outbound traffic through; it doubles as the public address.
#[derive(Debug, Clone, Default)]
pub struct HostIdentityProvider;

impl IdentityProvider for HostIdentityProvider {
    fn resolve(&self) -> IdentityFuture<'_> {
        Box::pin(async {
            tokio::task::spawn_blocking(resolve_host_identity)
                .await
                .map_err(|e| CacheError::Identity(e.to_string()))?
        })
    }
}

fn resolve_host_identity() -> CacheResult<Identity> {
    let serial = machine_serial()?;
    let fingerprint = fingerprint_for(&serial, std::process::id());
    let private_address = private_address().unwrap_or_else(|| "127.0.0.1".to_string());
    debug!(private_address = %private_address, "Resolved host identity");
    Ok(Identity {
        fingerprint,
        addresses: NetworkAddresses {
            public_address: private_address.clone(),
            private_address,
        },
    })
}

fn machine_serial() -> CacheResult<String> {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = std::fs::read_to_string(path) {
            let id = id.trim();
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }
    }
    let host = hostname::get()?;
    let host = host.to_string_lossy().trim().to_string();
    if host.is_empty() {
        return Err(CacheError::Identity("no machine id or hostname".to_string()));
    }
    Ok(host)
}

fn private_address() -> Option<String> {
    // Connecting a UDP socket sends nothing; it only selects a route.
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then(|| ip.to_string())
}

/// Provider returning a fixed identity.
#[derive(Debug, Clone)]
pub struct StaticIdentityProvider {
    identity: Identity,
}

impl StaticIdentityProvider {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn resolve(&self) -> IdentityFuture<'_> {
        let identity = self.identity.clone();
        Box::pin(async move { Ok(identity) })
    }
}
