//! Call policies applied to every outgoing remote call.
//!
//! A chain is an ordered list of layers, outermost first. Precondition layers
//! fail fast without invoking the call; the cache layer either writes the
//! live result through (online) or answers from disk (offline).

use std::fmt::Debug;

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::warn;

use crate::cache::{CacheError, CacheKey, Fetched, ResultCache};
use crate::client::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Cached,
    Online,
    Authenticated,
}

/// Read-type calls: cache outermost, authentication innermost.
pub const READ: &[Policy] = &[Policy::Cached, Policy::Authenticated];
/// Mutating calls never touch the cache and need a live connection.
pub const WRITE: &[Policy] = &[Policy::Online, Policy::Authenticated];
/// Login itself is cached so an offline start can reuse the last response.
pub const LOGIN: &[Policy] = &[Policy::Cached];

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("user not authenticated")]
    NotAuthenticated,
    #[error("client is offline")]
    Offline,
    #[error("no service endpoint configured")]
    NoEndpoint,
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub online: bool,
    pub authenticated: bool,
}

/// One call's view of the policies it passes through.
pub struct PolicyChain<'a> {
    layers: &'a [Policy],
    flags: SessionFlags,
    cache: Option<&'a ResultCache>,
    key: Option<CacheKey>,
}

impl<'a> PolicyChain<'a> {
    pub fn new(layers: &'a [Policy], flags: SessionFlags) -> Self {
        Self {
            layers,
            flags,
            cache: None,
            key: None,
        }
    }

    /// Enables the cache layer for the call `name(args)`.
    pub fn with_cache<A>(mut self, cache: Option<&'a ResultCache>, name: &str, args: &A) -> Self
    where
        A: Serialize + Debug + ?Sized,
    {
        self.cache = cache;
        self.key = Some(CacheKey::for_call(name, args));
        self
    }

    pub fn run<T, F>(self, call: F) -> Result<Fetched<T>, PolicyError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, PolicyError>,
    {
        self.run_layers(self.layers, call)
    }

    fn run_layers<T, F>(&self, layers: &[Policy], call: F) -> Result<Fetched<T>, PolicyError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, PolicyError>,
    {
        let Some((layer, rest)) = layers.split_first() else {
            return call().map(Fetched::Live);
        };

        match layer {
            Policy::Authenticated if !self.flags.authenticated => Err(PolicyError::NotAuthenticated),
            Policy::Online if !self.flags.online => Err(PolicyError::Offline),
            Policy::Authenticated | Policy::Online => self.run_layers(rest, call),
            Policy::Cached => {
                let (Some(cache), Some(key)) = (self.cache, self.key.as_ref()) else {
                    return self.run_layers(rest, call);
                };
                if self.flags.online {
                    let fetched = self.run_layers(rest, call)?;
                    if let Fetched::Live(value) = &fetched {
                        if let Err(err) = cache.store(key, value) {
                            warn!(error = %err, "failed to write cache entry");
                        }
                    }
                    Ok(fetched)
                } else {
                    Ok(read_cached(cache, key))
                }
            }
        }
    }
}

fn read_cached<T: DeserializeOwned>(cache: &ResultCache, key: &CacheKey) -> Fetched<T> {
    match cache.load(key) {
        Ok(Some(value)) => Fetched::Cached(value),
        Ok(None) => Fetched::Missing,
        Err(err) => {
            warn_unreadable(&err);
            Fetched::Missing
        }
    }
}

fn warn_unreadable(err: &CacheError) {
    warn!(error = %err, "ignoring unreadable cache entry");
}
