//! In-memory stand-ins for Drive and the detection service used by unit tests

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::sentinel::detection::{DetectionError, DetectionResult, DetectionService};
use crate::sentinel::drive::{DriveError, DriveResult, FileStore};
use crate::sentinel::reconcile::PollPolicy;
use crate::sentinel::{FileDescriptor, Report, ReportStatus, SubmitResponse};

/// Poll policy with a tiny interval and no caps.
pub fn fast_policy() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(2),
        deadline: None,
        max_polls: None,
    }
}

#[derive(Debug, Clone)]
struct FakeFile {
    name: String,
    size: Option<u64>,
    parents: Vec<String>,
    created_at: String,
}

#[derive(Debug, Default)]
struct StoreState {
    files: HashMap<String, FakeFile>,
    listing_order: Vec<String>,
    folders: HashMap<String, String>,
    reparent_calls: HashMap<String, usize>,
    reparent_order: Vec<String>,
    failing_reparents: HashSet<String>,
    failing_downloads: HashSet<String>,
    late_parents: HashMap<String, String>,
    downloads: Vec<String>,
    fail_listing: bool,
    token_expired: bool,
    active_downloads: usize,
    peak_downloads: usize,
    shared_handle_violations: usize,
}

/// A fake drive. Clones share the drive *and* the handle; `handle()` creates a new handle.
#[derive(Clone)]
pub struct FakeStore {
    state: Arc<Mutex<StoreState>>,
    busy: Arc<AtomicUsize>,
    download_delay: Arc<Mutex<Duration>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            busy: Arc::new(AtomicUsize::new(0)),
            download_delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Another client handle onto the same drive.
    pub fn handle(&self) -> Self {
        Self {
            state: self.state.clone(),
            busy: Arc::new(AtomicUsize::new(0)),
            download_delay: self.download_delay.clone(),
        }
    }

    pub fn handles(&self, count: usize) -> Vec<Self> {
        (0..count).map(|_| self.handle()).collect()
    }

    pub fn add_file(&self, id: &str, name: &str, size: Option<u64>, parents: &[&str]) {
        self.add_file_created(id, name, size, parents, "2024-01-01T00:00:00");
    }

    pub fn add_file_created(&self, id: &str, name: &str, size: Option<u64>, parents: &[&str], created_at: &str) {
        let mut state = self.state.lock();
        state.listing_order.push(id.to_string());
        state.files.insert(
            id.to_string(),
            FakeFile {
                name: name.to_string(),
                size,
                parents: parents.iter().map(|p| p.to_string()).collect(),
                created_at: created_at.to_string(),
            },
        );
    }

    pub fn add_folder(&self, name: &str, id: &str) {
        self.state.lock().folders.insert(name.to_string(), id.to_string());
    }

    pub fn folder_id(&self, name: &str) -> Option<String> {
        self.state.lock().folders.get(name).cloned()
    }

    pub fn parents_of(&self, id: &str) -> Vec<String> {
        let mut parents = self
            .state
            .lock()
            .files
            .get(id)
            .map(|f| f.parents.clone())
            .unwrap_or_default();
        parents.sort();
        parents
    }

    pub fn reparent_calls(&self, id: &str) -> usize {
        self.state.lock().reparent_calls.get(id).copied().unwrap_or(0)
    }

    pub fn reparent_order(&self) -> Vec<String> {
        self.state.lock().reparent_order.clone()
    }

    pub fn downloads(&self) -> Vec<String> {
        self.state.lock().downloads.clone()
    }

    pub fn peak_downloads(&self) -> usize {
        self.state.lock().peak_downloads
    }

    pub fn shared_handle_violations(&self) -> usize {
        self.state.lock().shared_handle_violations
    }

    pub fn fail_reparent(&self, id: &str) {
        self.state.lock().failing_reparents.insert(id.to_string());
    }

    pub fn fail_download(&self, id: &str) {
        self.state.lock().failing_downloads.insert(id.to_string());
    }

    pub fn fail_listing(&self) {
        self.state.lock().fail_listing = true;
    }

    /// Every later download, lookup and move is refused with 401.
    pub fn expire_token(&self) {
        self.state.lock().token_expired = true;
    }

    /// Simulate a concurrent edit landing between the parent lookup and the move.
    pub fn add_parent_after_lookup(&self, id: &str, parent: &str) {
        self.state.lock().late_parents.insert(id.to_string(), parent.to_string());
    }

    pub fn set_download_delay(&self, delay: Duration) {
        *self.download_delay.lock() = delay;
    }

    fn unauthorized() -> DriveError {
        DriveError::Unauthorized {
            status: 401,
            message: "Invalid Credentials".to_string(),
        }
    }

    fn not_found(id: &str) -> DriveError {
        DriveError::Api {
            status: 404,
            message: format!("File not found: {}", id),
        }
    }
}

#[async_trait]
impl FileStore for FakeStore {
    async fn list_files(
        &self,
        created_after: Option<&str>,
        exclude_folder_ids: &[String],
    ) -> DriveResult<Vec<FileDescriptor>> {
        let state = self.state.lock();
        if state.fail_listing {
            return Err(Self::unauthorized());
        }
        Ok(state
            .listing_order
            .iter()
            .filter_map(|id| state.files.get(id).map(|file| (id, file)))
            .filter(|(_, file)| created_after.is_none_or(|after| file.created_at.as_str() > after))
            .filter(|(_, file)| !file.parents.iter().any(|p| exclude_folder_ids.contains(p)))
            .map(|(id, file)| FileDescriptor {
                id: id.clone(),
                name: file.name.clone(),
                size: file.size,
                mime_type: "application/octet-stream".to_string(),
            })
            .collect())
    }

    async fn ensure_folder(&self, name: &str) -> DriveResult<String> {
        let mut state = self.state.lock();
        let next = format!("folder-{}", state.folders.len() + 1);
        Ok(state.folders.entry(name.to_string()).or_insert(next).clone())
    }

    async fn download(&self, file_id: &str) -> DriveResult<Vec<u8>> {
        if self.busy.fetch_add(1, Ordering::SeqCst) > 0 {
            self.state.lock().shared_handle_violations += 1;
        }
        {
            let mut state = self.state.lock();
            state.active_downloads += 1;
            state.peak_downloads = state.peak_downloads.max(state.active_downloads);
        }

        let delay = *self.download_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let mut state = self.state.lock();
            state.active_downloads -= 1;
            state.downloads.push(file_id.to_string());
            if state.token_expired {
                Err(Self::unauthorized())
            } else if state.failing_downloads.contains(file_id) {
                Err(DriveError::Api {
                    status: 403,
                    message: "fileNotDownloadable".to_string(),
                })
            } else {
                match state.files.get(file_id) {
                    Some(file) => Ok(vec![0u8; file.size.unwrap_or(0).min(64) as usize]),
                    None => Err(Self::not_found(file_id)),
                }
            }
        };
        self.busy.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn get_parents(&self, file_id: &str) -> DriveResult<Vec<String>> {
        let mut state = self.state.lock();
        if state.token_expired {
            return Err(Self::unauthorized());
        }
        let parents = state
            .files
            .get(file_id)
            .map(|file| file.parents.clone())
            .ok_or_else(|| Self::not_found(file_id))?;
        if let Some(late) = state.late_parents.remove(file_id) {
            if let Some(file) = state.files.get_mut(file_id) {
                file.parents.push(late);
            }
        }
        Ok(parents)
    }

    async fn reparent(&self, file_id: &str, remove: &[String], add: &str) -> DriveResult<Vec<String>> {
        let mut state = self.state.lock();
        *state.reparent_calls.entry(file_id.to_string()).or_insert(0) += 1;
        state.reparent_order.push(file_id.to_string());
        if state.token_expired {
            return Err(Self::unauthorized());
        }
        if state.failing_reparents.contains(file_id) {
            return Err(DriveError::Api {
                status: 500,
                message: "backendError".to_string(),
            });
        }
        let file = state
            .files
            .get_mut(file_id)
            .ok_or_else(|| Self::not_found(file_id))?;
        file.parents.retain(|parent| !remove.contains(parent));
        if !file.parents.iter().any(|parent| parent == add) {
            file.parents.push(add.to_string());
        }
        Ok(file.parents.clone())
    }
}

#[derive(Debug, Clone)]
struct Script {
    done_after: u32,
    malicious: bool,
    fetched: u32,
}

#[derive(Debug, Default)]
struct DetectionState {
    scripts: HashMap<String, Script>,
    by_name: HashMap<String, (u32, bool)>,
    failing_reports: HashSet<String>,
    transient: HashMap<String, u32>,
    polls: HashMap<String, u32>,
    rejected_names: HashSet<String>,
    unavailable_names: HashSet<String>,
    key_revoked: bool,
    offline: bool,
    submissions: Vec<String>,
    next_report: usize,
}

/// A fake detection service with per-report scripts.
#[derive(Default)]
pub struct FakeDetection {
    state: Mutex<DetectionState>,
}

impl FakeDetection {
    pub fn new() -> Self {
        Self::default()
    }

    /// The report is `DONE` on its `done_after`-th successful fetch.
    pub fn script_report(&self, report_id: &str, done_after: u32, malicious: bool) {
        self.state.lock().scripts.insert(
            report_id.to_string(),
            Script {
                done_after,
                malicious,
                fetched: 0,
            },
        );
    }

    /// Script the report that a future submission of `file_name` will receive.
    pub fn script_file(&self, file_name: &str, done_after: u32, malicious: bool) {
        self.state
            .lock()
            .by_name
            .insert(file_name.to_string(), (done_after, malicious));
    }

    /// Every fetch of this report fails with a client error.
    pub fn fail_report(&self, report_id: &str) {
        self.state.lock().failing_reports.insert(report_id.to_string());
    }

    /// The next `count` fetches of this report fail with a server error.
    pub fn transient_failures(&self, report_id: &str, count: u32) {
        self.state.lock().transient.insert(report_id.to_string(), count);
    }

    pub fn reject_file(&self, file_name: &str) {
        self.state.lock().rejected_names.insert(file_name.to_string());
    }

    /// Submitting this file fails with 503.
    pub fn fail_submission(&self, file_name: &str) {
        self.state.lock().unavailable_names.insert(file_name.to_string());
    }

    /// Every later call is refused with 401.
    pub fn revoke_key(&self) {
        self.state.lock().key_revoked = true;
    }

    /// Every later submission fails with 503.
    pub fn go_offline(&self) {
        self.state.lock().offline = true;
    }

    pub fn poll_count(&self, report_id: &str) -> u32 {
        self.state.lock().polls.get(report_id).copied().unwrap_or(0)
    }

    pub fn submissions(&self) -> Vec<String> {
        self.state.lock().submissions.clone()
    }
}

#[async_trait]
impl DetectionService for FakeDetection {
    async fn submit(&self, name: &str, _content: Vec<u8>) -> DetectionResult<SubmitResponse> {
        let mut state = self.state.lock();
        if state.key_revoked {
            return Err(revoked());
        }
        if state.offline || state.unavailable_names.contains(name) {
            return Err(DetectionError::Server {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        if state.rejected_names.contains(name) {
            return Ok(SubmitResponse {
                status: "error".to_string(),
                report_id: None,
            });
        }
        state.submissions.push(name.to_string());
        state.next_report += 1;
        let report_id = format!("report-{}", state.next_report);
        let (done_after, malicious) = state.by_name.get(name).copied().unwrap_or((1, false));
        state.scripts.insert(
            report_id.clone(),
            Script {
                done_after,
                malicious,
                fetched: 0,
            },
        );
        Ok(SubmitResponse {
            status: "success".to_string(),
            report_id: Some(report_id),
        })
    }

    async fn get_report(&self, report_id: &str) -> DetectionResult<Report> {
        let mut state = self.state.lock();
        *state.polls.entry(report_id.to_string()).or_insert(0) += 1;
        if state.key_revoked {
            return Err(revoked());
        }

        if state.failing_reports.contains(report_id) {
            return Err(DetectionError::Client {
                status: 404,
                message: format!("report {} not found", report_id),
            });
        }
        if let Some(remaining) = state.transient.get_mut(report_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DetectionError::Server {
                    status: 503,
                    message: "try again".to_string(),
                });
            }
        }

        let script = state.scripts.get_mut(report_id).ok_or_else(|| DetectionError::Client {
            status: 404,
            message: format!("report {} not found", report_id),
        })?;
        script.fetched += 1;
        let done = script.fetched >= script.done_after;
        Ok(Report {
            report_id: report_id.to_string(),
            overall_status: if done { ReportStatus::Done } else { ReportStatus::Pending },
            is_malicious: done && script.malicious,
            file_name: String::new(),
        })
    }
}

fn revoked() -> DetectionError {
    DetectionError::Client {
        status: 401,
        message: "invalid feye-auth-key".to_string(),
    }
}
