//! Cron scheduler.
//!
//! Jobs live in SQL so schedules survive restarts; the scheduler itself is
//! one background tick loop per process. Each fire runs under a global
//! semaphore (capacity 5) — when the pool is saturated the fire is
//! *skipped*, not queued, and the job simply waits for its next slot. Jobs
//! are serialized per job id: a fire never starts while the previous one is
//! still running. Failures retry with capped exponential backoff up to the
//! job's `retry_count`.
//!
//! The heartbeat subsystem rides the same machinery: one beat job per
//! agent (every 5 minutes, `main` every 30 seconds) refreshes
//! `last_active_at`, checks the gateway health flag, and flags an agent
//! `error` once it has been silent for three beat intervals.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use log::{debug, info, warn};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::aria::agent_pool::AgentPool;
use crate::aria::chat_engine::{ChatEngine, NewSession};
use crate::aria::error::EngineError;
use crate::aria::gateway::LlmGateway;
use crate::aria::store::{JobRun, SessionStore};
use crate::aria::tools::ToolBroker;
use crate::aria::types::{
    AgentStatus, CronJob, PayloadType, SessionMode, SessionType, ToolCall,
};

/// Global cap on concurrently executing jobs.
pub const MAX_CONCURRENT_JOBS: usize = 5;
/// Retry backoff base; doubles per attempt, capped below.
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Shortest accepted interval shorthand.
const MIN_INTERVAL: Duration = Duration::from_secs(30);
/// Missed beats before an agent is flagged.
const MISSED_BEATS: u32 = 3;

// ---------------------------------------------------------------------------
// Schedule parsing
// ---------------------------------------------------------------------------

/// One cron field as a bitmask over its legal range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    mask: u64,
    /// True when the field was `*` (or `*/1`), which matters for the
    /// day-of-month / day-of-week OR rule.
    unrestricted: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        self.mask & (1u64 << value) != 0
    }

    fn first_at_or_after(&self, value: u32) -> Option<u32> {
        (value..64).find(|v| self.contains(*v))
    }

    fn parse(field: &str, min: u32, max: u32) -> Result<Self, String> {
        let mut mask = 0u64;
        let mut unrestricted = field == "*";
        for part in field.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| format!("bad step in {:?}", part))?;
                    if step == 0 {
                        return Err(format!("zero step in {:?}", part));
                    }
                    (range, step)
                }
                None => (part, 1),
            };
            let (lo, hi) = if range == "*" {
                (min, max)
            } else if let Some((lo, hi)) = range.split_once('-') {
                (
                    lo.parse().map_err(|_| format!("bad range in {:?}", part))?,
                    hi.parse().map_err(|_| format!("bad range in {:?}", part))?,
                )
            } else {
                let v: u32 = range
                    .parse()
                    .map_err(|_| format!("bad value in {:?}", part))?;
                (v, v)
            };
            if lo < min || hi > max || lo > hi {
                return Err(format!("{:?} outside {}..={}", part, min, max));
            }
            let mut v = lo;
            while v <= hi {
                // Day-of-week 7 is an alias for Sunday.
                let bit = if max == 7 && v == 7 { 0 } else { v };
                mask |= 1u64 << bit;
                v += step;
            }
            if range == "*" && step == 1 {
                unrestricted = true;
            }
        }
        if mask == 0 {
            return Err(format!("empty field {:?}", field));
        }
        Ok(Self { mask, unrestricted })
    }
}

/// A parsed cron expression, with or without a seconds field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    raw: String,
    seconds: Option<FieldSet>,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronExpr {
    fn parse(raw: &str) -> Result<Self, String> {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        let (seconds, rest) = match fields.len() {
            5 => (None, &fields[..]),
            6 => (Some(FieldSet::parse(fields[0], 0, 59)?), &fields[1..]),
            n => return Err(format!("expected 5 or 6 fields, got {}", n)),
        };
        Ok(Self {
            raw: raw.to_string(),
            seconds,
            minutes: FieldSet::parse(rest[0], 0, 59)?,
            hours: FieldSet::parse(rest[1], 0, 23)?,
            days_of_month: FieldSet::parse(rest[2], 1, 31)?,
            months: FieldSet::parse(rest[3], 1, 12)?,
            days_of_week: FieldSet::parse(rest[4], 0, 7)?,
        })
    }

    /// Day matching uses the classic cron rule: when both day-of-month and
    /// day-of-week are restricted, either may match; otherwise the
    /// restricted one decides.
    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(t.day());
        let dow = self
            .days_of_week
            .contains(t.weekday().num_days_from_sunday());
        match (
            self.days_of_month.unrestricted,
            self.days_of_week.unrestricted,
        ) {
            (false, false) => dom || dow,
            (false, true) => dom,
            (true, false) => dow,
            (true, true) => true,
        }
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = truncate_to_minute(after);
        let mut first_minute = true;
        if self.seconds.is_none() {
            t = next_minute(t);
            first_minute = false;
        }

        // Bounded walk: four years of minutes is plenty for any real rule.
        for _ in 0..(4 * 366 * 24 * 60) {
            if !self.months.contains(t.month()) {
                t = next_month(t)?;
                first_minute = false;
                continue;
            }
            if !self.day_matches(t) {
                t = next_day(t);
                first_minute = false;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = next_hour(t);
                first_minute = false;
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = next_minute(t);
                first_minute = false;
                continue;
            }
            match &self.seconds {
                None => return Some(t),
                Some(seconds) => {
                    let floor = if first_minute && t == truncate_to_minute(after) {
                        after.second() + 1
                    } else {
                        0
                    };
                    if let Some(second) = seconds.first_at_or_after(floor) {
                        if second <= 59 {
                            return t.with_second(second);
                        }
                    }
                    t = next_minute(t);
                    first_minute = false;
                }
            }
        }
        None
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let ts = t.timestamp();
    DateTime::<Utc>::from_timestamp(ts - ts.rem_euclid(60), 0).expect("valid timestamp")
}

fn next_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(t) + chrono::Duration::minutes(1)
}

fn next_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    let ts = t.timestamp();
    DateTime::<Utc>::from_timestamp(ts - ts.rem_euclid(3600) + 3600, 0).expect("valid timestamp")
}

fn next_day(t: DateTime<Utc>) -> DateTime<Utc> {
    let ts = t.timestamp();
    DateTime::<Utc>::from_timestamp(ts - ts.rem_euclid(86_400) + 86_400, 0).expect("valid timestamp")
}

fn next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// A parsed trigger: fixed interval or cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Interval { raw: String, every: Duration },
    Cron(CronExpr),
}

impl Schedule {
    /// Parse `<N>{s|m|h}` shorthand, a 5-field cron, or a 6-field cron with
    /// seconds. Anything else is an invalid schedule.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(EngineError::InvalidSchedule("empty schedule".to_string()));
        }
        if let Some(interval) = parse_interval(raw) {
            if interval < MIN_INTERVAL {
                return Err(EngineError::InvalidSchedule(format!(
                    "interval {:?} is below the {}s minimum",
                    raw,
                    MIN_INTERVAL.as_secs()
                )));
            }
            return Ok(Schedule::Interval {
                raw: raw.to_string(),
                every: interval,
            });
        }
        CronExpr::parse(raw)
            .map(Schedule::Cron)
            .map_err(|e| EngineError::InvalidSchedule(format!("{:?}: {}", raw, e)))
    }

    /// The next fire strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval { every, .. } => {
                Some(after + chrono::Duration::from_std(*every).ok()?)
            }
            Schedule::Cron(expr) => expr.next_after(after),
        }
    }

    /// Interval length for interval schedules; for cron rules, the gap
    /// between the next two fires. Used by heartbeat silence detection.
    pub fn approximate_period(&self) -> Duration {
        match self {
            Schedule::Interval { every, .. } => *every,
            Schedule::Cron(expr) => {
                let now = Utc::now();
                match (expr.next_after(now), expr.next_after(now).and_then(|t| expr.next_after(t))) {
                    (Some(a), Some(b)) => (b - a).to_std().unwrap_or(Duration::from_secs(300)),
                    _ => Duration::from_secs(300),
                }
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval { raw, .. } => write!(f, "{}", raw),
            Schedule::Cron(expr) => write!(f, "{}", expr.raw),
        }
    }
}

impl FromStr for Schedule {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::parse(s)
    }
}

fn parse_interval(raw: &str) -> Option<Duration> {
    let unit = raw.chars().last()?;
    let number: u64 = raw[..raw.len() - 1].parse().ok()?;
    match unit {
        's' => Some(Duration::from_secs(number)),
        'm' => Some(Duration::from_secs(number * 60)),
        'h' => Some(Duration::from_secs(number * 3600)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    store: Arc<SessionStore>,
    pool: Arc<AgentPool>,
    broker: Arc<ToolBroker>,
    chat: Arc<ChatEngine>,
    gateway: Arc<LlmGateway>,
    semaphore: Arc<Semaphore>,
    /// Jobs currently executing; a job never overlaps itself.
    running: Arc<Mutex<HashSet<Uuid>>>,
    /// Session reused across fires for `shared`-mode jobs.
    shared_sessions: Arc<Mutex<HashMap<Uuid, Uuid>>>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<SessionStore>,
        pool: Arc<AgentPool>,
        broker: Arc<ToolBroker>,
        chat: Arc<ChatEngine>,
        gateway: Arc<LlmGateway>,
        max_concurrent: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            pool,
            broker,
            chat,
            gateway,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            running: Arc::new(Mutex::new(HashSet::new())),
            shared_sessions: Arc::new(Mutex::new(HashMap::new())),
            tick_task: Mutex::new(None),
        })
    }

    // --------------------------- job CRUD ----------------------------

    /// Validate and persist a new job; `next_run_at` is computed up front.
    pub async fn add_job(&self, mut job: CronJob) -> Result<CronJob, EngineError> {
        validate_job(&job)?;
        let schedule = Schedule::parse(&job.schedule)?;
        if self.store.get_agent(&job.agent_id).await?.is_none() {
            return Err(EngineError::Scheduler(format!(
                "unknown target agent: {}",
                job.agent_id
            )));
        }
        job.next_run_at = schedule.next_after(Utc::now());
        self.store.upsert_job(&job).await?;
        info!("added cron job {} ({})", job.name, job.schedule);
        Ok(job)
    }

    pub async fn update_job(&self, mut job: CronJob) -> Result<CronJob, EngineError> {
        validate_job(&job)?;
        let schedule = Schedule::parse(&job.schedule)?;
        job.next_run_at = schedule.next_after(Utc::now());
        self.store.upsert_job(&job).await?;
        Ok(job)
    }

    pub async fn remove_job(&self, id: Uuid) -> Result<bool, EngineError> {
        self.store.delete_job(id).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<CronJob>, EngineError> {
        self.store.get_job(id).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<CronJob>, EngineError> {
        self.store.list_jobs(false).await
    }

    pub async fn history(&self, id: Uuid, limit: i64) -> Result<Vec<JobRun>, EngineError> {
        self.store.job_history(id, limit).await
    }

    /// Fire a job immediately, outside its schedule. Still honors the
    /// concurrency cap and the no-overlap rule.
    pub async fn trigger(self: &Arc<Self>, id: Uuid) -> Result<(), EngineError> {
        let job = self
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| EngineError::Scheduler(format!("job not found: {}", id)))?;
        self.clone().fire(job).await;
        Ok(())
    }

    // --------------------------- lifecycle ---------------------------

    /// Start the tick loop and install heartbeat jobs for every agent.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        self.ensure_heartbeat_jobs().await?;

        // Seed next_run_at for enabled jobs that lack one (fresh restore).
        for mut job in self.store.list_jobs(true).await? {
            if job.next_run_at.is_none() {
                if let Ok(schedule) = Schedule::parse(&job.schedule) {
                    job.next_run_at = schedule.next_after(Utc::now());
                    self.store.upsert_job(&job).await?;
                }
            }
        }

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            info!("scheduler started");
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.tick().await {
                    warn!("scheduler tick failed: {}", e);
                }
            }
        });
        *self.tick_task.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.tick_task.lock().await.take() {
            handle.abort();
            info!("scheduler stopped");
        }
    }

    async fn tick(self: &Arc<Self>) -> Result<(), EngineError> {
        let now = Utc::now();
        let jobs = self.store.list_jobs(true).await?;
        for job in jobs {
            let due = matches!(job.next_run_at, Some(at) if at <= now);
            if !due {
                continue;
            }
            if self.running.lock().await.contains(&job.id) {
                // Previous fire still going; per-job ordering wins.
                continue;
            }
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.fire(job).await;
            });
        }
        Ok(())
    }

    /// One fire of one job, including retries and bookkeeping.
    async fn fire(self: Arc<Self>, mut job: CronJob) {
        let schedule = match Schedule::parse(&job.schedule) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!("job {} has unparseable schedule: {}", job.name, e);
                job.enabled = false;
                job.last_error = Some(e.to_string());
                let _ = self.store.upsert_job(&job).await;
                return;
            }
        };

        // At the concurrency cap the fire is skipped, not queued; the next
        // slot is recomputed so the job stays live.
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            debug!("job {} skipped: scheduler at capacity", job.name);
            job.next_run_at = schedule.next_after(Utc::now());
            let _ = self.store.upsert_job(&job).await;
            return;
        };

        {
            let mut running = self.running.lock().await;
            if !running.insert(job.id) {
                return;
            }
        }

        let started_at = Utc::now();
        let started = std::time::Instant::now();
        let max_duration = Duration::from_secs(u64::from(job.max_duration_seconds));

        let mut outcome: Result<String, String> =
            Err("job never attempted".to_string());
        for attempt in 0..=job.retry_count {
            if attempt > 0 {
                let backoff = BACKOFF_BASE
                    .checked_mul(1 << (attempt - 1).min(5))
                    .unwrap_or(BACKOFF_CAP)
                    .min(BACKOFF_CAP);
                tokio::time::sleep(backoff).await;
            }
            outcome = match tokio::time::timeout(max_duration, self.dispatch(&job)).await {
                Ok(Ok(summary)) => Ok(summary),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "timed out after {}s",
                    job.max_duration_seconds
                )),
            };
            if outcome.is_ok() {
                break;
            }
            warn!(
                "job {} attempt {}/{} failed: {}",
                job.name,
                attempt + 1,
                job.retry_count + 1,
                outcome.as_ref().err().map(String::as_str).unwrap_or("?")
            );
        }

        let duration_ms = started.elapsed().as_millis() as i64;
        job.last_run_at = Some(started_at);
        job.last_duration_ms = Some(duration_ms);
        job.run_count += 1;
        match &outcome {
            Ok(_) => {
                job.last_status = Some("success".to_string());
                job.last_error = None;
                job.success_count += 1;
            }
            Err(e) => {
                job.last_status = Some("failed".to_string());
                job.last_error = Some(e.clone());
                job.fail_count += 1;
            }
        }
        job.next_run_at = schedule.next_after(Utc::now());
        if let Err(e) = self.store.upsert_job(&job).await {
            warn!("job {} bookkeeping failed: {}", job.name, e);
        }
        let _ = self
            .store
            .record_job_run(&JobRun {
                job_id: job.id,
                started_at,
                duration_ms,
                status: job.last_status.clone().unwrap_or_default(),
                error: job.last_error.clone(),
            })
            .await;

        self.running.lock().await.remove(&job.id);
        drop(permit);
    }

    /// Dispatch a job's payload. Returns a short human summary on success.
    async fn dispatch(&self, job: &CronJob) -> Result<String, EngineError> {
        if let Some(agent_id) = job.payload.get("heartbeat").and_then(|v| v.as_str()) {
            return self.beat(agent_id, job).await;
        }

        if self.store.get_agent(&job.agent_id).await?.is_none() {
            return Err(EngineError::Scheduler(format!(
                "target agent {} no longer exists",
                job.agent_id
            )));
        }

        match job.payload_type {
            PayloadType::Prompt => {
                let prompt = job
                    .payload
                    .get("prompt")
                    .and_then(|v| v.as_str())
                    .or_else(|| job.payload.as_str())
                    .ok_or_else(|| {
                        EngineError::Scheduler("prompt payload missing text".to_string())
                    })?
                    .to_string();
                let session_id = self.resolve_session(job).await?;
                let outcome = self
                    .chat
                    .send_message(session_id, &prompt, false, true)
                    .await?;
                Ok(format!(
                    "prompt run: {} tokens out",
                    outcome.tokens_output
                ))
            }
            PayloadType::Skill => {
                let skill = job
                    .payload
                    .get("skill")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| EngineError::Scheduler("skill payload missing name".to_string()))?;
                let method = job
                    .payload
                    .get("method")
                    .and_then(|v| v.as_str())
                    .unwrap_or("run");
                let args = job
                    .payload
                    .get("args")
                    .cloned()
                    .unwrap_or(serde_json::json!({}));
                let call = ToolCall {
                    id: format!("cron_{}", Uuid::new_v4()),
                    name: format!("{}__{}", skill, method),
                    arguments: args.to_string(),
                };
                let outcome = self.broker.dispatch(&call).await;
                if outcome.success {
                    Ok(format!("skill {} ran in {}ms", call.name, outcome.duration_ms))
                } else {
                    Err(EngineError::Tool(outcome.content))
                }
            }
            PayloadType::Pipeline => Err(EngineError::Scheduler(
                "pipeline payloads are not wired in this deployment".to_string(),
            )),
        }
    }

    /// Resolve the session a `prompt` payload runs in, per the job's
    /// session mode.
    async fn resolve_session(&self, job: &CronJob) -> Result<Uuid, EngineError> {
        match job.session_mode {
            SessionMode::Isolated => {
                let session = self
                    .chat
                    .create_session(NewSession {
                        agent_id: job.agent_id.clone(),
                        session_type: Some(SessionType::Cron),
                        title: Some(format!("cron: {}", job.name)),
                        ..NewSession::default()
                    })
                    .await?;
                Ok(session.id)
            }
            SessionMode::Shared => {
                let mut shared = self.shared_sessions.lock().await;
                if let Some(session_id) = shared.get(&job.id) {
                    if self.store.get_session(*session_id).await?.is_some() {
                        return Ok(*session_id);
                    }
                }
                let session = self
                    .chat
                    .create_session(NewSession {
                        agent_id: job.agent_id.clone(),
                        session_type: Some(SessionType::Cron),
                        title: Some(format!("cron: {}", job.name)),
                        ..NewSession::default()
                    })
                    .await?;
                shared.insert(job.id, session.id);
                Ok(session.id)
            }
            SessionMode::Persistent => {
                let agent = self
                    .store
                    .get_agent(&job.agent_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Scheduler(format!("unknown agent: {}", job.agent_id))
                    })?;
                if let Some(session_id) = agent.current_session_id {
                    if self.store.get_session(session_id).await?.is_some() {
                        return Ok(session_id);
                    }
                }
                let session = self
                    .chat
                    .create_session(NewSession {
                        agent_id: job.agent_id.clone(),
                        session_type: Some(SessionType::Cron),
                        title: Some(format!("{} persistent", job.agent_id)),
                        ..NewSession::default()
                    })
                    .await?;
                let mut agent = agent;
                agent.current_session_id = Some(session.id);
                self.store.upsert_agent(&agent).await?;
                Ok(session.id)
            }
        }
    }

    // --------------------------- heartbeat ---------------------------

    /// Install one beat job per registered agent: every 5 minutes, `main`
    /// every 30 seconds. Existing beat jobs are left alone.
    async fn ensure_heartbeat_jobs(&self) -> Result<(), EngineError> {
        let agents = self.store.list_agents().await?;
        let existing: HashSet<String> = self
            .store
            .list_jobs(false)
            .await?
            .into_iter()
            .map(|j| j.name)
            .collect();
        for agent in agents {
            let name = format!("heartbeat:{}", agent.agent_id);
            if existing.contains(&name) {
                continue;
            }
            let schedule = if agent.agent_id == "main" { "30s" } else { "5m" };
            let mut job = CronJob::new(
                name,
                schedule,
                agent.agent_id.clone(),
                PayloadType::Skill,
                serde_json::json!({"heartbeat": agent.agent_id}),
            );
            job.max_duration_seconds = 30;
            job.next_run_at = Schedule::parse(schedule)?.next_after(Utc::now());
            self.store.upsert_job(&job).await?;
        }
        Ok(())
    }

    /// One heartbeat: refresh liveness while the gateway is healthy, and
    /// flag agents that have been silent for three intervals.
    async fn beat(&self, agent_id: &str, job: &CronJob) -> Result<String, EngineError> {
        let Some(mut agent) = self.store.get_agent(agent_id).await? else {
            return Err(EngineError::Scheduler(format!(
                "heartbeat target {} no longer exists",
                agent_id
            )));
        };
        let interval = Schedule::parse(&job.schedule)?.approximate_period();
        let silence_cap = interval * MISSED_BEATS;
        let now = Utc::now();

        if self.gateway.is_healthy().await {
            agent.last_active_at = Some(now);
            if agent.status == AgentStatus::Error && agent.consecutive_failures == 0 {
                agent.status = AgentStatus::Idle;
            }
            self.store.upsert_agent(&agent).await?;
            return Ok(format!("beat {}", agent_id));
        }

        let silent_for = agent
            .last_active_at
            .map(|at| now - at)
            .unwrap_or_else(chrono::Duration::zero);
        if silent_for.to_std().unwrap_or_default() > silence_cap
            && agent.status != AgentStatus::Disabled
        {
            warn!(
                "agent {} silent for {}s with unhealthy gateway; flagging error",
                agent_id,
                silent_for.num_seconds()
            );
            agent.status = AgentStatus::Error;
            self.store.upsert_agent(&agent).await?;
        }
        Ok(format!("beat {} (gateway unhealthy)", agent_id))
    }

    /// Is a previous fire of this job still running?
    pub async fn is_running(&self, id: Uuid) -> bool {
        self.running.lock().await.contains(&id)
    }
}

fn validate_job(job: &CronJob) -> Result<(), EngineError> {
    if job.name.trim().is_empty() {
        return Err(EngineError::Validation("job name is required".to_string()));
    }
    if !(10..=3600).contains(&job.max_duration_seconds) {
        return Err(EngineError::Validation(format!(
            "max_duration_seconds must be 10..=3600, got {}",
            job.max_duration_seconds
        )));
    }
    if job.retry_count > 5 {
        return Err(EngineError::Validation(format!(
            "retry_count must be 0..=5, got {}",
            job.retry_count
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn interval_shorthand_parses() {
        assert!(matches!(
            Schedule::parse("15m").unwrap(),
            Schedule::Interval { every, .. } if every == Duration::from_secs(900)
        ));
        assert!(matches!(
            Schedule::parse("1h").unwrap(),
            Schedule::Interval { every, .. } if every == Duration::from_secs(3600)
        ));
        assert!(matches!(
            Schedule::parse("30s").unwrap(),
            Schedule::Interval { every, .. } if every == Duration::from_secs(30)
        ));
    }

    #[test]
    fn tiny_intervals_are_rejected() {
        assert!(matches!(
            Schedule::parse("5s"),
            Err(EngineError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn garbage_is_an_invalid_schedule() {
        assert!(Schedule::parse("whenever").is_err());
        assert!(Schedule::parse("* * *").is_err());
        assert!(Schedule::parse("61 * * * *").is_err());
        assert!(Schedule::parse("").is_err());
    }

    #[test]
    fn five_field_cron_finds_next_minute() {
        let schedule = Schedule::parse("*/15 * * * *").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 12, 7, 30)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 12, 15, 0));
    }

    #[test]
    fn five_field_cron_rolls_over_hours_and_days() {
        let schedule = Schedule::parse("30 9 * * *").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 10, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 11, 9, 30, 0));
    }

    #[test]
    fn day_of_week_is_honored() {
        // Mondays at 08:00. 2026-03-10 is a Tuesday.
        let schedule = Schedule::parse("0 8 * * 1").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 12, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 16, 8, 0, 0));
    }

    #[test]
    fn dow_seven_is_sunday() {
        let a = Schedule::parse("0 8 * * 0").unwrap();
        let b = Schedule::parse("0 8 * * 7").unwrap();
        let from = at(2026, 3, 10, 12, 0, 0);
        assert_eq!(a.next_after(from), b.next_after(from));
    }

    #[test]
    fn six_field_cron_supports_seconds() {
        let schedule = Schedule::parse("*/20 * * * * *").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 12, 7, 5)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 12, 7, 20));
        let next = schedule.next_after(at(2026, 3, 10, 12, 7, 45)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 12, 8, 0));
    }

    #[test]
    fn month_restriction_jumps_months() {
        let schedule = Schedule::parse("0 0 1 6 *").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 6, 1, 0, 0, 0));
    }

    #[test]
    fn schedule_round_trips_through_display() {
        for raw in ["15m", "30s", "*/5 * * * *", "0 9 * * 1-5", "*/10 2 * * * *"] {
            let parsed = Schedule::parse(raw).unwrap();
            let reparsed = Schedule::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed, "round-trip failed for {:?}", raw);
            let from = at(2026, 5, 1, 0, 0, 0);
            assert_eq!(parsed.next_after(from), reparsed.next_after(from));
        }
    }

    #[test]
    fn interval_next_fire_is_relative() {
        let schedule = Schedule::parse("10m").unwrap();
        let from = at(2026, 3, 10, 12, 0, 0);
        assert_eq!(schedule.next_after(from).unwrap(), at(2026, 3, 10, 12, 10, 0));
    }

    #[test]
    fn job_bounds_are_validated() {
        let mut job = CronJob::new(
            "j",
            "15m",
            "main",
            PayloadType::Prompt,
            serde_json::json!({"prompt": "hi"}),
        );
        job.max_duration_seconds = 5;
        assert!(validate_job(&job).is_err());
        job.max_duration_seconds = 300;
        job.retry_count = 9;
        assert!(validate_job(&job).is_err());
        job.retry_count = 3;
        assert!(validate_job(&job).is_ok());
    }
}
