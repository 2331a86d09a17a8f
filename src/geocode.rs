use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::config::TelemetryConfig;
use crate::transport::HttpTransport;

/// Reverse-geocoding response; every field is optional on the wire
#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
    address: Option<AddressParts>,
}

#[derive(Debug, Deserialize)]
struct AddressParts {
    road: Option<String>,
    city: Option<String>,
    state: Option<String>,
    country: Option<String>,
}

/// Address for a coordinate and whether it came from the cache
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub address: String,
    pub was_cache_hit: bool,
}

struct CacheEntry {
    address: String,
    inserted_at: Instant,
    // Tie-breaker for entries inserted at the same instant
    seq: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

/// Memoizing reverse geocoder.
///
/// # Cache Policy
/// - Key: coordinate rounded to 4 decimals (~11 m)
/// - Entries expire `ttl` after insertion
/// - At most `capacity` entries; overflow evicts the oldest insertion, not the
///   least recently read
/// - Fallback strings are never cached, so a failed lookup is retried on the
///   next miss
///
/// # Error Handling
/// Never fails: timeouts, HTTP errors and unusable bodies all resolve to
/// `"Coordinates {lat}, {lon}"`.
pub struct GeocodeCache<T: HttpTransport> {
    transport: Arc<T>,
    url: String,
    timeout: Duration,
    ttl: Duration,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl<T: HttpTransport> GeocodeCache<T> {
    pub fn new(transport: Arc<T>, url: String, timeout: Duration, ttl: Duration, capacity: usize) -> Self {
        Self {
            transport,
            url,
            timeout,
            ttl,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn from_config(transport: Arc<T>, config: &TelemetryConfig) -> Self {
        Self::new(
            transport,
            config.geocode_url.clone(),
            config.geocode_timeout(),
            config.cache_ttl(),
            config.cache_capacity,
        )
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn resolve(&self, lat: f64, lon: f64) -> Resolution {
        let key = cache_key(lat, lon);

        if let Some(address) = self.lookup(&key) {
            log::debug!("Geocode cache hit for {}", key);
            return Resolution {
                address,
                was_cache_hit: true,
            };
        }

        log::debug!("Geocode cache miss for {}, querying {}", key, self.url);
        let address = match self.fetch(lat, lon).await {
            Some(address) => {
                self.insert(key, address.clone());
                address
            }
            None => fallback_address(lat, lon),
        };

        Resolution {
            address,
            was_cache_hit: false,
        }
    }

    fn lookup(&self, key: &str) -> Option<String> {
        self.lock_state()
            .entries
            .get(key)
            .filter(|entry| entry.inserted_at.elapsed() < self.ttl)
            .map(|entry| entry.address.clone())
    }

    async fn fetch(&self, lat: f64, lon: f64) -> Option<String> {
        let query = [
            ("lat", lat.to_string()),
            ("lon", lon.to_string()),
            ("format", "json".to_string()),
            ("addressdetails", "1".to_string()),
        ];

        let body = match tokio::time::timeout(self.timeout, self.transport.get(&self.url, &query)).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                log::warn!("Reverse geocode failed for ({}, {}): {}", lat, lon, e);
                return None;
            }
            Err(_) => {
                log::warn!(
                    "Reverse geocode timed out after {:?} for ({}, {})",
                    self.timeout,
                    lat,
                    lon
                );
                return None;
            }
        };

        let address = parse_address(&body);
        if address.is_none() {
            log::warn!("Reverse geocode returned no usable address for ({}, {})", lat, lon);
        }
        address
    }

    fn insert(&self, key: String, address: String) {
        let mut state = self.lock_state();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            key,
            CacheEntry {
                address,
                inserted_at: Instant::now(),
                seq,
            },
        );

        if state.entries.len() > self.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.inserted_at, entry.seq))
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                log::debug!("Geocode cache full, evicting {}", oldest);
                state.entries.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let key = cache_key(lat, lon);
        self.lock_state().entries.contains_key(&key)
    }

    pub fn clear(&self) {
        self.lock_state().entries.clear();
    }
}

/// Cache key: coordinate rounded to 4 decimals
pub fn cache_key(lat: f64, lon: f64) -> String {
    format!("{:.4},{:.4}", lat, lon)
}

/// Address used whenever a real one cannot be obtained
pub fn fallback_address(lat: f64, lon: f64) -> String {
    format!("Coordinates {:.6}, {:.6}", lat, lon)
}

/// Extract an address from a reverse-geocoding body.
///
/// Prefers `display_name`; otherwise joins road, city, state and country.
fn parse_address(body: &[u8]) -> Option<String> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    let response: ReverseResponse = serde_json::from_slice(body).ok()?;

    if let Some(name) = response.display_name.map(|n| n.trim().to_string()) {
        if !name.is_empty() {
            return Some(name);
        }
    }

    let parts = response.address?;
    let joined = [parts.road, parts.city, parts.state, parts.country]
        .into_iter()
        .flatten()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ");

    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}
