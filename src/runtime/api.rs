//! Request router: JSON API over the [`Registry`] plus static files.
//!
//! Every API response uses the envelope `{"success", "message", "data"?}`.
//! Business failures come back as 400/404 envelopes (503 once the registry is
//! closed for shutdown); the router itself only
//! returns `Err` for unexpected failures.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{Category, OccupantRecord, Registry, RegistryError};

use super::http::{Request, Response};
use super::listener::Handler;

const VEHICLE_PREFIX: &str = "/api/vehicle/";

/// Longest admission wait a router honours unless told otherwise.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);

/// Routes requests to registry operations or the static directory.
pub struct Router {
    registry: Arc<Registry>,
    static_dir: Option<PathBuf>,
    default_wait: Duration,
    max_wait: Duration,
}

impl Router {
    /// Router over `registry` with no static directory and no default wait.
    /// Waits are capped at [`DEFAULT_MAX_WAIT`].
    #[must_use]
    pub const fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            static_dir: None,
            default_wait: Duration::ZERO,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    /// Serve non-API paths from `dir`.
    #[must_use]
    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    /// Admission wait used when a request carries no `waitMs`.
    #[must_use]
    pub const fn with_default_wait(mut self, wait: Duration) -> Self {
        self.default_wait = wait;
        self
    }

    /// Upper bound on any admission wait, including client `waitMs`.
    #[must_use]
    pub const fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    /// Shared registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Dispatch one request.
    #[must_use]
    pub fn route(&self, req: &Request) -> Response {
        if req.method == "OPTIONS" {
            return Response::new(204);
        }
        if !req.path.starts_with("/api/") {
            return self.static_file(&req.path);
        }

        match (req.method.as_str(), req.path.as_str()) {
            ("POST", "/api/vehicle") => self.admit(req),
            ("GET", "/api/status") => self.status(),
            ("PUT", "/api/rate") => self.set_rates(req),
            ("GET", "/api/history") => self.history(),
            ("GET", "/api/current-vehicles") => self.current(),
            ("DELETE", path) if path.starts_with(VEHICLE_PREFIX) => {
                self.release(&percent_decode(&path[VEHICLE_PREFIX.len()..]))
            }
            ("GET", path) if path.starts_with(VEHICLE_PREFIX) => {
                self.query(&percent_decode(&path[VEHICLE_PREFIX.len()..]))
            }
            _ => failure(404, "API endpoint not found"),
        }
    }

    fn admit(&self, req: &Request) -> Response {
        let body: AdmitBody = match serde_json::from_slice(&req.body) {
            Ok(body) => body,
            Err(e) => return failure(400, &format!("Missing or invalid plate/type: {e}")),
        };
        let plate = body.plate.trim();
        if plate.is_empty() {
            return failure(400, "Plate must not be empty");
        }
        let category = match body.category.parse::<Category>() {
            Ok(c) => c,
            Err(e) => return failure(400, &e),
        };
        let wait = body
            .wait_ms
            .map_or(self.default_wait, Duration::from_millis)
            .min(self.max_wait);

        match self.registry.admit(plate, category, wait) {
            Ok(record) => success(200, "Vehicle added successfully", Some(VehicleView::from(&record))),
            Err(e @ RegistryError::Closed) => failure(503, &describe(&e)),
            Err(e) => failure(400, &describe(&e)),
        }
    }

    fn release(&self, plate: &str) -> Response {
        match self.registry.release(plate) {
            Ok(record) => success(
                200,
                "Vehicle removed successfully",
                Some(ReleasedView {
                    plate: &record.key,
                    category: record.category,
                    fee: record.fee,
                }),
            ),
            Err(e) => failure(404, &describe(&e)),
        }
    }

    fn query(&self, plate: &str) -> Response {
        match self.registry.query(plate) {
            Some(record) => success(200, "Vehicle found", Some(VehicleView::from(&record))),
            None => failure(404, "Vehicle not found"),
        }
    }

    fn status(&self) -> Response {
        success(200, "Status retrieved", Some(self.registry.status()))
    }

    fn set_rates(&self, req: &Request) -> Response {
        let body: RatesBody = match serde_json::from_slice(&req.body) {
            Ok(body) => body,
            Err(e) => return failure(400, &format!("Error updating rates: {e}")),
        };
        match self.registry.set_rates(body.small_rate, body.large_rate) {
            Ok(_) => success::<()>(200, "Rates updated successfully", None),
            Err(e) => failure(400, &format!("Error updating rates: {}", describe(&e))),
        }
    }

    fn history(&self) -> Response {
        let records = self.registry.list_history();
        let views: Vec<VehicleView<'_>> = records.iter().map(VehicleView::from).collect();
        success(200, "History retrieved", Some(views))
    }

    fn current(&self) -> Response {
        let rates = self.registry.rates();
        let records = self.registry.list_current();
        let views: Vec<CurrentView<'_>> = records
            .iter()
            .map(|r| CurrentView {
                plate: &r.key,
                category: r.category,
                entry_time: r.admitted_at,
                hourly_rate: rates.rate_for(r.category),
            })
            .collect();
        success(200, "Current vehicles retrieved", Some(views))
    }

    fn static_file(&self, path: &str) -> Response {
        let Some(root) = &self.static_dir else {
            return failure(404, "File not found");
        };
        let relative = if path == "/" { "index.html" } else { path.trim_start_matches('/') };
        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return failure(404, "File not found");
        }

        let full = root.join(relative);
        match std::fs::read(&full) {
            Ok(bytes) => Response::new(200)
                .with_header("Content-Type", mime_type(&full))
                .with_body(bytes),
            Err(e) => {
                debug!(path = %full.display(), error = %e, "Static file not served");
                failure(404, "File not found")
            }
        }
    }
}

impl Handler for Router {
    fn handle(&self, request: &Request) -> anyhow::Result<Response> {
        Ok(self.route(request))
    }

    fn shutdown(&self) {
        self.registry.close();
    }
}

#[derive(Debug, Deserialize)]
struct AdmitBody {
    plate: String,
    #[serde(rename = "type")]
    category: String,
    #[serde(rename = "waitMs")]
    wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RatesBody {
    small_rate: f64,
    large_rate: f64,
}

#[derive(Debug, Serialize)]
struct Envelope<'a, T> {
    success: bool,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VehicleView<'a> {
    plate: &'a str,
    #[serde(rename = "type")]
    category: Category,
    entry_time: i64,
    /// 0 while still present.
    exit_time: i64,
    fee: f64,
}

impl<'a> From<&'a OccupantRecord> for VehicleView<'a> {
    fn from(r: &'a OccupantRecord) -> Self {
        Self {
            plate: &r.key,
            category: r.category,
            entry_time: r.admitted_at,
            exit_time: r.released_at.unwrap_or(0),
            fee: r.fee,
        }
    }
}

#[derive(Debug, Serialize)]
struct ReleasedView<'a> {
    plate: &'a str,
    #[serde(rename = "type")]
    category: Category,
    fee: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CurrentView<'a> {
    plate: &'a str,
    #[serde(rename = "type")]
    category: Category,
    entry_time: i64,
    hourly_rate: f64,
}

fn success<T: Serialize>(status: u16, message: &str, data: Option<T>) -> Response {
    Response::json(
        status,
        &Envelope {
            success: true,
            message,
            data,
        },
    )
}

fn failure(status: u16, message: &str) -> Response {
    Response::json(
        status,
        &Envelope::<()> {
            success: false,
            message,
            data: None,
        },
    )
}

fn describe(e: &RegistryError) -> String {
    match e {
        RegistryError::Duplicate(key) => format!("Vehicle {key} is already parked"),
        RegistryError::Full => "Parking lot is full".into(),
        RegistryError::WaitTimedOut => "Parking lot is full (wait timed out)".into(),
        RegistryError::NotFound(_) => "Vehicle not found".into(),
        RegistryError::AlreadyReleased(key) => format!("Vehicle {key} has already left"),
        RegistryError::InvalidRate => "Rates must be positive numbers".into(),
        RegistryError::Closed => "Server is shutting down".into(),
    }
}

/// Decode `%XX` escapes and `+` as space. Invalid escapes are kept verbatim.
#[must_use]
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

const fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Content type by file extension.
#[must_use]
pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
