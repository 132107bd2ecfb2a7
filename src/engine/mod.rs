//! The job-queue engine: owns every job, tube, and connection, and is the
//! only thing that ever mutates them. Runs on a single task (see
//! `crate::server`); every method here is synchronous and non-blocking, so
//! there is never a lock to take.
//!
//! State-changing commands that are durable follow one rule throughout this
//! module: call the WAL first, and only touch in-memory state once that
//! call returns `Ok`. An `OUT_OF_MEMORY` reply this way never leaves a job
//! half-mutated.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;
use tracing::error;

use crate::types::conn::{ConnState, Waiting};
use crate::types::job::{ConnId, Job, JobId, JobState, DEADLINE_SOON_MARGIN};
use crate::types::tube::{Tube, TubeName};
use crate::wal::{RecordState, RecoveredJob, Wal};
use crate::wire::protocol::{JobStats, Response, ServerStats, TubeStatsResp};

/// Mirrors the shape of `wire::decoder::Error` / `wire::encoder::Error`:
/// a flat enum distinguishing conditions callers should report to the
/// client (`OutOfMemory`) from ones that indicate a bug in this process,
/// which are logged and surfaced as `INTERNAL_ERROR` rather than panicking a
/// connection handler.
#[derive(Debug, Error)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Error> for Response {
    fn from(error: Error) -> Response {
        match error {
            Error::OutOfMemory => Response::OutOfMemory,
            Error::Internal(msg) => {
                error!(%msg, "engine invariant violated");
                Response::InternalError
            },
        }
    }
}

/// The engine's command surface, decoupled from `wire::protocol::Command` so
/// the wire layer's framing details (e.g. the job body arriving as a
/// separate chunked read) don't leak in here.
#[derive(Debug, Clone)]
pub enum Request {
    Put { pri: u32, delay: u32, ttr: u32, body: Bytes },
    Use { tube: Vec<u8> },
    Reserve,
    ReserveWithTimeout { timeout: u32 },
    ReserveJob { id: u64 },
    Delete { id: u64 },
    Release { id: u64, pri: u32, delay: u32 },
    Bury { id: u64, pri: u32 },
    Touch { id: u64 },
    Watch { tube: Vec<u8> },
    Ignore { tube: Vec<u8> },
    Peek { id: u64 },
    PeekReady,
    PeekDelayed,
    PeekBuried,
    Kick { bound: u64 },
    KickJob { id: u64 },
    StatsJob { id: u64 },
    StatsTube { tube: Vec<u8> },
    StatsServer,
    ListTubes,
    ListTubeUsed,
    ListTubesWatched,
    PauseTube { tube: Vec<u8>, delay: u32 },
    Quit,
}

#[derive(Debug, Clone, Copy)]
pub enum JobKind {
    Reserved,
    Found,
}

/// The result of dispatching one [`Request`]. `Deferred` means the request
/// blocked (a `reserve` with nothing ready); the caller hears nothing more
/// until a later [`Engine::tick`] produces a reply for this connection.
#[derive(Debug)]
pub enum Outcome {
    Reply(Response),
    Job { id: u64, body: Bytes, kind: JobKind },
    Deferred,
    Close,
}

#[derive(Debug, Default)]
struct Counters {
    cmd_put: u64,
    cmd_peek: u64,
    cmd_peek_ready: u64,
    cmd_peek_delayed: u64,
    cmd_peek_buried: u64,
    cmd_reserve: u64,
    cmd_reserve_with_timeout: u64,
    cmd_touch: u64,
    cmd_use: u64,
    cmd_watch: u64,
    cmd_ignore: u64,
    cmd_delete: u64,
    cmd_release: u64,
    cmd_bury: u64,
    cmd_kick: u64,
    cmd_stats: u64,
    cmd_stats_job: u64,
    cmd_stats_tube: u64,
    cmd_list_tubes: u64,
    cmd_list_tube_used: u64,
    cmd_list_tubes_watched: u64,
    cmd_pause_tube: u64,
    job_timeouts: u64,
    total_jobs: u64,
    total_connections: u64,
}

fn generate_server_id() -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn uname_info() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    match nix::sys::utsname::uname() {
        Ok(u) => (
            u.nodename().to_string_lossy().into_owned().into_bytes(),
            u.sysname().to_string_lossy().into_owned().into_bytes(),
            u.machine().to_string_lossy().into_owned().into_bytes(),
        ),
        Err(error) => {
            error!(%error, "uname failed");
            (Vec::new(), Vec::new(), Vec::new())
        },
    }
}

pub struct Engine {
    jobs: HashMap<JobId, Job>,
    tubes: HashMap<TubeName, Tube>,
    conns: HashMap<ConnId, ConnState>,
    wal: Option<Wal>,
    max_job_size: u32,
    next_job_id: u64,
    next_conn_id: u64,
    start_time: Instant,
    draining: bool,
    server_id: String,
    counters: Counters,
}

impl Engine {
    pub fn new(
        max_job_size: u32,
        wal: Option<Wal>,
        recovered: Vec<RecoveredJob>,
        now: Instant,
    ) -> Self {
        let mut engine = Engine {
            jobs: HashMap::new(),
            tubes: HashMap::new(),
            conns: HashMap::new(),
            wal,
            max_job_size,
            next_job_id: 1,
            next_conn_id: 1,
            start_time: now,
            draining: false,
            server_id: generate_server_id(),
            counters: Counters::default(),
        };
        engine
            .tubes
            .insert(TubeName::default_tube(), Tube::new(TubeName::default_tube()));

        let mut max_id = 0u64;
        for recovered_job in recovered {
            max_id = max_id.max(recovered_job.id);
            let Some(id) = JobId::new(recovered_job.id) else { continue };
            let tube_name =
                TubeName::parse(&recovered_job.tube).unwrap_or_else(TubeName::default_tube);
            let ttr = Duration::from_secs(recovered_job.ttr_secs.max(1) as u64);
            let delay = Duration::from_secs(recovered_job.delay_secs as u64);
            let body = Bytes::from(recovered_job.body);

            engine
                .tubes
                .entry(tube_name.clone())
                .or_insert_with_key(|n| Tube::new(n.clone()));

            let mut job = Job {
                id,
                tube: tube_name.clone(),
                priority: recovered_job.priority,
                delay,
                ttr,
                body,
                created_at: now,
                deadline_at: now,
                state: JobState::Ready,
                reserve_count: 0,
                timeout_count: 0,
                release_count: 0,
                bury_count: 0,
                kick_count: 0,
                ready_pos: None,
                delayed_pos: None,
                reserved_by: None,
                wal_file: recovered_job.anchor_segment,
            };

            match recovered_job.state {
                RecordState::Buried => {
                    job.state = JobState::Buried;
                    engine.jobs.insert(id, job);
                    if let Some(tube) = engine.tubes.get_mut(&tube_name) {
                        tube.bury_push(id);
                    }
                },
                RecordState::Delayed => {
                    job.state = JobState::Delayed;
                    job.deadline_at = now + delay;
                    let deadline = job.deadline_at;
                    engine.jobs.insert(id, job);
                    Self::delayed_push(&mut engine.tubes, &mut engine.jobs, &tube_name, id, deadline);
                },
                RecordState::Ready => {
                    engine.jobs.insert(id, job);
                    Self::ready_push(
                        &mut engine.tubes,
                        &mut engine.jobs,
                        &tube_name,
                        id,
                        recovered_job.priority,
                    );
                },
            }
            if let Some(tube) = engine.tubes.get_mut(&tube_name) {
                tube.stats.total_jobs += 1;
            }
        }
        engine.next_job_id = max_id + 1;
        engine.counters.total_jobs = engine.jobs.len() as u64;

        engine
    }

    pub fn set_draining(&mut self, draining: bool) {
        self.draining = draining;
    }

    /// Exposes the WAL for a final flush on shutdown. Every other mutation
    /// goes through `dispatch`/`tick`/`drop_conn` so the WAL write always
    /// precedes the matching in-memory change.
    pub fn wal_mut(&mut self) -> Option<&mut Wal> {
        self.wal.as_mut()
    }

    // --- heap helper functions, operating on disjoint `self` fields so the
    // borrow checker can see the `tubes` and `jobs` borrows don't overlap. ---

    fn ready_push(
        tubes: &mut HashMap<TubeName, Tube>,
        jobs: &mut HashMap<JobId, Job>,
        tube_name: &TubeName,
        id: JobId,
        pri: u32,
    ) {
        let tube = tubes
            .entry(tube_name.clone())
            .or_insert_with_key(|n| Tube::new(n.clone()));
        tube.ready_push(pri, id, |jid, pos| {
            if let Some(job) = jobs.get_mut(&jid) {
                job.ready_pos = Some(pos);
            }
        });
    }

    fn ready_pop(
        tubes: &mut HashMap<TubeName, Tube>,
        jobs: &mut HashMap<JobId, Job>,
        tube_name: &TubeName,
    ) -> Option<JobId> {
        let tube = tubes.get_mut(tube_name)?;
        let id = tube.ready_pop(|jid, pos| {
            if let Some(job) = jobs.get_mut(&jid) {
                job.ready_pos = Some(pos);
            }
        })?;
        if let Some(job) = jobs.get_mut(&id) {
            job.ready_pos = None;
        }
        Some(id)
    }

    fn ready_remove(
        tubes: &mut HashMap<TubeName, Tube>,
        jobs: &mut HashMap<JobId, Job>,
        tube_name: &TubeName,
        pos: usize,
        pri: u32,
    ) {
        if let Some(tube) = tubes.get_mut(tube_name) {
            tube.ready_remove(pos, pri, |jid, p| {
                if let Some(job) = jobs.get_mut(&jid) {
                    job.ready_pos = Some(p);
                }
            });
        }
    }

    fn delayed_push(
        tubes: &mut HashMap<TubeName, Tube>,
        jobs: &mut HashMap<JobId, Job>,
        tube_name: &TubeName,
        id: JobId,
        deadline: Instant,
    ) {
        let tube = tubes
            .entry(tube_name.clone())
            .or_insert_with_key(|n| Tube::new(n.clone()));
        tube.delayed_push(deadline, id, |jid, pos| {
            if let Some(job) = jobs.get_mut(&jid) {
                job.delayed_pos = Some(pos);
            }
        });
    }

    fn delayed_pop(
        tubes: &mut HashMap<TubeName, Tube>,
        jobs: &mut HashMap<JobId, Job>,
        tube_name: &TubeName,
    ) -> Option<JobId> {
        let tube = tubes.get_mut(tube_name)?;
        let id = tube.delayed_pop(|jid, pos| {
            if let Some(job) = jobs.get_mut(&jid) {
                job.delayed_pos = Some(pos);
            }
        })?;
        if let Some(job) = jobs.get_mut(&id) {
            job.delayed_pos = None;
        }
        Some(id)
    }

    fn delayed_remove(
        tubes: &mut HashMap<TubeName, Tube>,
        jobs: &mut HashMap<JobId, Job>,
        tube_name: &TubeName,
        pos: usize,
    ) {
        if let Some(tube) = tubes.get_mut(tube_name) {
            tube.delayed_remove(pos, |jid, p| {
                if let Some(job) = jobs.get_mut(&jid) {
                    job.delayed_pos = Some(p);
                }
            });
        }
    }

    fn bug(&self, msg: impl Into<String>) -> Response {
        Error::Internal(msg.into()).into()
    }

    fn collect_tube_garbage(&mut self) {
        let default = TubeName::default_tube();
        self.tubes.retain(|name, tube| *name == default || !tube.is_collectible());
    }

    fn recompute_soonest_deadline(&mut self, conn_id: ConnId) {
        let Some(conn) = self.conns.get(&conn_id) else { return };
        let soonest = conn
            .reserved
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .map(|job| job.deadline_at.checked_sub(DEADLINE_SOON_MARGIN).unwrap_or(job.deadline_at))
            .min();
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.soonest_deadline_at = soonest;
        }
    }

    fn clear_waiting(&mut self, conn_id: ConnId) {
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.waiting = None;
        }
    }

    // --- connection lifecycle ---

    pub fn register_conn(&mut self) -> ConnId {
        let id = ConnId::new(self.next_conn_id);
        self.next_conn_id += 1;
        let default = TubeName::default_tube();
        let tube = self
            .tubes
            .entry(default.clone())
            .or_insert_with_key(|n| Tube::new(n.clone()));
        tube.use_count += 1;
        tube.watch_count += 1;
        self.conns.insert(id, ConnState::new(default));
        self.counters.total_connections += 1;
        id
    }

    pub fn drop_conn(&mut self, conn_id: ConnId, now: Instant) {
        let Some(conn) = self.conns.remove(&conn_id) else { return };

        for id in conn.reserved.iter().copied().collect::<Vec<_>>() {
            let Some(job) = self.jobs.get(&id) else { continue };
            let tube_name = job.tube.clone();
            let pri = job.priority;
            let ttr_secs = job.ttr.as_secs() as u32;
            if let Some(wal) = &mut self.wal {
                let _ = wal.record_update(id.get(), pri, 0, ttr_secs, RecordState::Ready);
            }
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Ready;
                job.reserved_by = None;
                job.deadline_at = now;
            }
            Self::ready_push(&mut self.tubes, &mut self.jobs, &tube_name, id, pri);
        }

        if let Some(tube) = self.tubes.get_mut(&conn.used) {
            tube.use_count = tube.use_count.saturating_sub(1);
        }
        for name in &conn.watched {
            if let Some(tube) = self.tubes.get_mut(name) {
                tube.watch_count = tube.watch_count.saturating_sub(1);
            }
        }

        self.collect_tube_garbage();
    }

    // --- command surface ---

    pub fn dispatch(&mut self, conn_id: ConnId, req: Request, now: Instant) -> Outcome {
        match req {
            Request::Put { pri, delay, ttr, body } => {
                if self.draining {
                    return Outcome::Reply(Response::Draining);
                }
                Outcome::Reply(self.put(conn_id, pri, delay, ttr, body, now))
            },
            Request::Use { tube } => Outcome::Reply(self.use_tube(conn_id, tube)),
            Request::Reserve => {
                self.counters.cmd_reserve += 1;
                self.try_reserve(conn_id, None, now)
            },
            Request::ReserveWithTimeout { timeout } => {
                self.counters.cmd_reserve_with_timeout += 1;
                let deadline = now + Duration::from_secs(timeout as u64);
                self.try_reserve(conn_id, Some(deadline), now)
            },
            Request::ReserveJob { id } => self.cmd_reserve_job(conn_id, id, now),
            Request::Delete { id } => Outcome::Reply(self.delete(conn_id, id)),
            Request::Release { id, pri, delay } => {
                Outcome::Reply(self.release(conn_id, id, pri, delay, now))
            },
            Request::Bury { id, pri } => Outcome::Reply(self.bury(conn_id, id, pri)),
            Request::Touch { id } => Outcome::Reply(self.touch(conn_id, id, now)),
            Request::Watch { tube } => Outcome::Reply(self.watch(conn_id, tube)),
            Request::Ignore { tube } => Outcome::Reply(self.ignore(conn_id, tube)),
            Request::Peek { id } => {
                self.counters.cmd_peek += 1;
                self.peek(id)
            },
            Request::PeekReady => {
                self.counters.cmd_peek_ready += 1;
                self.peek_ready(conn_id)
            },
            Request::PeekDelayed => {
                self.counters.cmd_peek_delayed += 1;
                self.peek_delayed(conn_id)
            },
            Request::PeekBuried => {
                self.counters.cmd_peek_buried += 1;
                self.peek_buried(conn_id)
            },
            Request::Kick { bound } => {
                let count = self.kick(conn_id, bound, now);
                Outcome::Reply(Response::KickedCount { count })
            },
            Request::KickJob { id } => Outcome::Reply(self.kick_job(id, now)),
            Request::StatsJob { id } => {
                self.counters.cmd_stats_job += 1;
                match self.stats_job(id, now) {
                    Some(data) => Outcome::Reply(Response::OkStatsJob { data }),
                    None => Outcome::Reply(Response::NotFound),
                }
            },
            Request::StatsTube { tube } => {
                self.counters.cmd_stats_tube += 1;
                match self.stats_tube(&tube, now) {
                    Some(data) => Outcome::Reply(Response::OkStatsTube { data }),
                    None => Outcome::Reply(Response::NotFound),
                }
            },
            Request::StatsServer => {
                self.counters.cmd_stats += 1;
                Outcome::Reply(Response::OkStats { data: self.stats_server(now) })
            },
            Request::ListTubes => {
                self.counters.cmd_list_tubes += 1;
                Outcome::Reply(Response::OkListTubes { tubes: self.list_tubes() })
            },
            Request::ListTubeUsed => {
                self.counters.cmd_list_tube_used += 1;
                Outcome::Reply(Response::Using { tube: self.list_tube_used(conn_id) })
            },
            Request::ListTubesWatched => {
                self.counters.cmd_list_tubes_watched += 1;
                Outcome::Reply(Response::OkListTubes { tubes: self.list_tubes_watched(conn_id) })
            },
            Request::PauseTube { tube, delay } => Outcome::Reply(self.pause_tube(&tube, delay, now)),
            Request::Quit => Outcome::Close,
        }
    }

    fn put(&mut self, conn_id: ConnId, pri: u32, delay: u32, ttr: u32, body: Bytes, now: Instant) -> Response {
        self.counters.cmd_put += 1;
        let Some(conn) = self.conns.get(&conn_id) else {
            return self.bug("put from unregistered connection");
        };
        let tube_name = conn.used.clone();
        let ttr_secs = ttr.max(1);

        if body.len() as u32 > self.max_job_size {
            return Response::JobTooBig;
        }

        if let Some(wal) = &mut self.wal {
            if wal.put(self.next_job_id, tube_name.as_bytes(), pri, delay, ttr_secs, &body).is_err() {
                return Response::OutOfMemory;
            }
        }

        let id = JobId::new(self.next_job_id).expect("job id counter starts at 1 and only grows");
        self.next_job_id += 1;
        let wal_file = self.wal.as_ref().and_then(|wal| wal.anchor_of(id.get())).unwrap_or(0);

        let mut job = Job {
            id,
            tube: tube_name.clone(),
            priority: pri,
            delay: Duration::from_secs(delay as u64),
            ttr: Duration::from_secs(ttr_secs as u64),
            body,
            created_at: now,
            deadline_at: now,
            state: JobState::Ready,
            reserve_count: 0,
            timeout_count: 0,
            release_count: 0,
            bury_count: 0,
            kick_count: 0,
            ready_pos: None,
            delayed_pos: None,
            reserved_by: None,
            wal_file,
        };

        self.tubes
            .entry(tube_name.clone())
            .or_insert_with_key(|n| Tube::new(n.clone()));

        if job.delay.is_zero() {
            self.jobs.insert(id, job);
            Self::ready_push(&mut self.tubes, &mut self.jobs, &tube_name, id, pri);
        } else {
            job.state = JobState::Delayed;
            job.deadline_at = now + job.delay;
            let deadline = job.deadline_at;
            self.jobs.insert(id, job);
            Self::delayed_push(&mut self.tubes, &mut self.jobs, &tube_name, id, deadline);
        }

        if let Some(tube) = self.tubes.get_mut(&tube_name) {
            tube.stats.total_jobs += 1;
        }
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.is_producer = true;
        }
        self.counters.total_jobs += 1;

        Response::Inserted { id: id.get() }
    }

    fn use_tube(&mut self, conn_id: ConnId, raw_tube: Vec<u8>) -> Response {
        self.counters.cmd_use += 1;
        let Some(name) = TubeName::parse(&raw_tube) else { return Response::BadFormat };
        let Some(conn) = self.conns.get(&conn_id) else {
            return self.bug("use from unregistered connection");
        };
        let prev = conn.used.clone();

        if prev != name {
            if let Some(tube) = self.tubes.get_mut(&prev) {
                tube.use_count = tube.use_count.saturating_sub(1);
            }
            let tube = self
                .tubes
                .entry(name.clone())
                .or_insert_with_key(|n| Tube::new(n.clone()));
            tube.use_count += 1;
            if let Some(conn) = self.conns.get_mut(&conn_id) {
                conn.used = name.clone();
            }
            self.collect_tube_garbage();
        }

        Response::Using { tube: name.as_bytes().to_vec() }
    }

    fn try_reserve(&mut self, conn_id: ConnId, deadline: Option<Instant>, now: Instant) -> Outcome {
        let Some(conn) = self.conns.get(&conn_id) else {
            return Outcome::Reply(self.bug("reserve from unregistered connection"));
        };
        if let Some(soonest) = conn.soonest_deadline_at {
            if soonest <= now {
                return Outcome::Reply(Response::DeadlineSoon);
            }
        }

        if let Some(id) = self.dispatch_ready_job(conn_id, now) {
            let body = self.jobs[&id].body.clone();
            return Outcome::Job { id: id.get(), body, kind: JobKind::Reserved };
        }

        if let Some(d) = deadline {
            if d <= now {
                return Outcome::Reply(Response::TimedOut);
            }
        }

        let watched: Vec<TubeName> = self.conns[&conn_id].watched.iter().cloned().collect();
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.waiting = Some(Waiting { requested_at: now, deadline });
        }
        for name in watched {
            let tube = self
                .tubes
                .entry(name.clone())
                .or_insert_with_key(|n| Tube::new(n.clone()));
            tube.waiting.push_back(conn_id);
        }
        Outcome::Deferred
    }

    /// Finds the best (lowest priority, lowest id) ready job across this
    /// connection's watched, unpaused tubes, reserves it, and returns its
    /// id. Updates the reserving connection's bookkeeping (`reserved`,
    /// `soonest_deadline_at`, `is_worker`).
    fn dispatch_ready_job(&mut self, conn_id: ConnId, now: Instant) -> Option<JobId> {
        let watched: Vec<TubeName> = self.conns.get(&conn_id)?.watched.iter().cloned().collect();
        let mut best: Option<(u32, JobId, TubeName)> = None;
        for name in &watched {
            let Some(tube) = self.tubes.get(name) else { continue };
            if tube.is_paused(now) {
                continue;
            }
            let Some(id) = tube.ready_peek() else { continue };
            let Some(job) = self.jobs.get(&id) else { continue };
            let key = (job.priority, id);
            let better = best.as_ref().map_or(true, |(p, i, _)| key < (*p, *i));
            if better {
                best = Some((job.priority, id, name.clone()));
            }
        }
        let (pri, id, tube_name) = best?;

        let popped = Self::ready_pop(&mut self.tubes, &mut self.jobs, &tube_name);
        debug_assert_eq!(popped, Some(id));

        let ttr = self.jobs.get(&id)?.ttr;
        let deadline_at = now + ttr;
        if let Some(job) = self.jobs.get_mut(&id) {
            job.state = JobState::Reserved;
            job.reserved_by = Some(conn_id);
            job.deadline_at = deadline_at;
            job.reserve_count += 1;
        }
        let _ = pri;

        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.reserved.insert(id);
            conn.is_worker = true;
            conn.waiting = None;
            let soon = deadline_at.checked_sub(DEADLINE_SOON_MARGIN).unwrap_or(deadline_at);
            conn.soonest_deadline_at = Some(match conn.soonest_deadline_at {
                Some(existing) => existing.min(soon),
                None => soon,
            });
        }

        Some(id)
    }

    fn cmd_reserve_job(&mut self, conn_id: ConnId, raw_id: u64, now: Instant) -> Outcome {
        let Some(id) = JobId::new(raw_id) else { return Outcome::Reply(Response::NotFound) };
        let Some(job) = self.jobs.get(&id) else { return Outcome::Reply(Response::NotFound) };
        if job.state != JobState::Ready {
            return Outcome::Reply(Response::NotFound);
        }
        let tube_name = job.tube.clone();
        let pri = job.priority;

        if let Some(pos) = job.ready_pos {
            Self::ready_remove(&mut self.tubes, &mut self.jobs, &tube_name, pos, pri);
        }

        let ttr = self.jobs[&id].ttr;
        let deadline_at = now + ttr;
        if let Some(job) = self.jobs.get_mut(&id) {
            job.state = JobState::Reserved;
            job.reserved_by = Some(conn_id);
            job.deadline_at = deadline_at;
            job.reserve_count += 1;
        }
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.reserved.insert(id);
            conn.is_worker = true;
        }
        self.recompute_soonest_deadline(conn_id);

        let body = self.jobs[&id].body.clone();
        Outcome::Job { id: raw_id, body, kind: JobKind::Reserved }
    }

    fn delete(&mut self, conn_id: ConnId, raw_id: u64) -> Response {
        self.counters.cmd_delete += 1;
        let Some(id) = JobId::new(raw_id) else { return Response::NotFound };
        let Some(job) = self.jobs.get(&id) else { return Response::NotFound };

        let allowed = match job.state {
            JobState::Reserved => job.reserved_by == Some(conn_id),
            _ => true,
        };
        if !allowed {
            return Response::NotFound;
        }

        let tube_name = job.tube.clone();
        let pri = job.priority;
        let state = job.state;

        if let Some(wal) = &mut self.wal {
            if wal.delete(id.get()).is_err() {
                return Response::OutOfMemory;
            }
        }

        match state {
            JobState::Ready => {
                if let Some(pos) = self.jobs[&id].ready_pos {
                    Self::ready_remove(&mut self.tubes, &mut self.jobs, &tube_name, pos, pri);
                }
            },
            JobState::Delayed => {
                if let Some(pos) = self.jobs[&id].delayed_pos {
                    Self::delayed_remove(&mut self.tubes, &mut self.jobs, &tube_name, pos);
                }
            },
            JobState::Buried => {
                if let Some(tube) = self.tubes.get_mut(&tube_name) {
                    tube.bury_remove(id);
                }
            },
            JobState::Reserved => {
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.reserved.remove(&id);
                }
                self.recompute_soonest_deadline(conn_id);
            },
        }

        if let Some(tube) = self.tubes.get_mut(&tube_name) {
            tube.stats.cmd_delete += 1;
        }

        self.jobs.remove(&id);
        self.collect_tube_garbage();
        Response::Deleted
    }

    fn release(&mut self, conn_id: ConnId, raw_id: u64, pri: u32, delay: u32, now: Instant) -> Response {
        self.counters.cmd_release += 1;
        let Some(id) = JobId::new(raw_id) else { return Response::NotFound };
        let Some(job) = self.jobs.get(&id) else { return Response::NotFound };
        if job.state != JobState::Reserved || job.reserved_by != Some(conn_id) {
            return Response::NotFound;
        }

        let tube_name = job.tube.clone();
        let ttr_secs = job.ttr.as_secs() as u32;
        let body = job.body.clone();
        let delay_dur = Duration::from_secs(delay as u64);

        if let Some(wal) = &mut self.wal {
            let new_state = if delay_dur.is_zero() { RecordState::Ready } else { RecordState::Delayed };
            let result = if wal.needs_compaction(id.get()) {
                wal.compact(id.get(), tube_name.as_bytes(), pri, delay, ttr_secs, &body)
            } else {
                wal.record_update(id.get(), pri, delay, ttr_secs, new_state)
            };
            if result.is_err() {
                return Response::OutOfMemory;
            }
        }

        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.reserved.remove(&id);
        }
        self.recompute_soonest_deadline(conn_id);

        if let Some(job) = self.jobs.get_mut(&id) {
            job.priority = pri;
            job.delay = delay_dur;
            job.reserved_by = None;
            job.release_count += 1;
        }

        if delay_dur.is_zero() {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Ready;
                job.deadline_at = now;
            }
            Self::ready_push(&mut self.tubes, &mut self.jobs, &tube_name, id, pri);
        } else {
            let deadline = now + delay_dur;
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Delayed;
                job.deadline_at = deadline;
            }
            Self::delayed_push(&mut self.tubes, &mut self.jobs, &tube_name, id, deadline);
        }

        Response::Released
    }

    fn bury(&mut self, conn_id: ConnId, raw_id: u64, pri: u32) -> Response {
        self.counters.cmd_bury += 1;
        let Some(id) = JobId::new(raw_id) else { return Response::NotFound };
        let Some(job) = self.jobs.get(&id) else { return Response::NotFound };
        if job.state != JobState::Reserved || job.reserved_by != Some(conn_id) {
            return Response::NotFound;
        }

        let tube_name = job.tube.clone();
        let ttr_secs = job.ttr.as_secs() as u32;
        let body = job.body.clone();

        if let Some(wal) = &mut self.wal {
            let result = if wal.needs_compaction(id.get()) {
                wal.compact(id.get(), tube_name.as_bytes(), pri, 0, ttr_secs, &body)
            } else {
                wal.record_update(id.get(), pri, 0, ttr_secs, RecordState::Buried)
            };
            if result.is_err() {
                return Response::OutOfMemory;
            }
        }

        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.reserved.remove(&id);
        }
        self.recompute_soonest_deadline(conn_id);

        if let Some(job) = self.jobs.get_mut(&id) {
            job.priority = pri;
            job.state = JobState::Buried;
            job.reserved_by = None;
            job.bury_count += 1;
        }
        if let Some(tube) = self.tubes.get_mut(&tube_name) {
            tube.bury_push(id);
        }

        Response::Buried
    }

    fn touch(&mut self, conn_id: ConnId, raw_id: u64, now: Instant) -> Response {
        self.counters.cmd_touch += 1;
        let Some(id) = JobId::new(raw_id) else { return Response::NotFound };
        let Some(job) = self.jobs.get(&id) else { return Response::NotFound };
        if job.state != JobState::Reserved || job.reserved_by != Some(conn_id) {
            return Response::NotFound;
        }

        let tube_name = job.tube.clone();
        let pri = job.priority;
        let ttr = job.ttr;
        let body = job.body.clone();

        if let Some(wal) = &mut self.wal {
            let result = if wal.needs_compaction(id.get()) {
                wal.compact(id.get(), tube_name.as_bytes(), pri, 0, ttr.as_secs() as u32, &body)
            } else {
                wal.record_update(id.get(), pri, 0, ttr.as_secs() as u32, RecordState::Ready)
            };
            if result.is_err() {
                return Response::OutOfMemory;
            }
        }

        if let Some(job) = self.jobs.get_mut(&id) {
            job.deadline_at = now + ttr;
        }
        self.recompute_soonest_deadline(conn_id);
        Response::Touched
    }

    fn watch(&mut self, conn_id: ConnId, raw_tube: Vec<u8>) -> Response {
        self.counters.cmd_watch += 1;
        let Some(name) = TubeName::parse(&raw_tube) else { return Response::BadFormat };
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return self.bug("watch from unregistered connection");
        };
        let is_new = conn.watched.insert(name.clone());
        if is_new {
            let tube = self
                .tubes
                .entry(name)
                .or_insert_with_key(|n| Tube::new(n.clone()));
            tube.watch_count += 1;
        }
        let count = self.conns[&conn_id].watched.len() as u32;
        Response::Watching { count }
    }

    fn ignore(&mut self, conn_id: ConnId, raw_tube: Vec<u8>) -> Response {
        self.counters.cmd_ignore += 1;
        let Some(name) = TubeName::parse(&raw_tube) else { return Response::BadFormat };
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return self.bug("ignore from unregistered connection");
        };
        if conn.watched.len() <= 1 {
            return Response::NotIgnored;
        }
        let removed = conn.watched.remove(&name);
        let count = conn.watched.len() as u32;
        if removed {
            if let Some(tube) = self.tubes.get_mut(&name) {
                tube.watch_count = tube.watch_count.saturating_sub(1);
            }
            self.collect_tube_garbage();
        }
        Response::Watching { count }
    }

    fn peek(&self, raw_id: u64) -> Outcome {
        let Some(id) = JobId::new(raw_id) else { return Outcome::Reply(Response::NotFound) };
        match self.jobs.get(&id) {
            Some(job) => Outcome::Job { id: raw_id, body: job.body.clone(), kind: JobKind::Found },
            None => Outcome::Reply(Response::NotFound),
        }
    }

    fn peek_ready(&self, conn_id: ConnId) -> Outcome {
        let Some(conn) = self.conns.get(&conn_id) else { return Outcome::Reply(Response::NotFound) };
        let Some(tube) = self.tubes.get(&conn.used) else { return Outcome::Reply(Response::NotFound) };
        match tube.ready_peek() {
            Some(id) => Outcome::Job { id: id.get(), body: self.jobs[&id].body.clone(), kind: JobKind::Found },
            None => Outcome::Reply(Response::NotFound),
        }
    }

    fn peek_delayed(&self, conn_id: ConnId) -> Outcome {
        let Some(conn) = self.conns.get(&conn_id) else { return Outcome::Reply(Response::NotFound) };
        let Some(tube) = self.tubes.get(&conn.used) else { return Outcome::Reply(Response::NotFound) };
        match tube.delayed_peek() {
            Some(id) => Outcome::Job { id: id.get(), body: self.jobs[&id].body.clone(), kind: JobKind::Found },
            None => Outcome::Reply(Response::NotFound),
        }
    }

    fn peek_buried(&self, conn_id: ConnId) -> Outcome {
        let Some(conn) = self.conns.get(&conn_id) else { return Outcome::Reply(Response::NotFound) };
        let Some(tube) = self.tubes.get(&conn.used) else { return Outcome::Reply(Response::NotFound) };
        match tube.bury_front() {
            Some(id) => Outcome::Job { id: id.get(), body: self.jobs[&id].body.clone(), kind: JobKind::Found },
            None => Outcome::Reply(Response::NotFound),
        }
    }

    fn kick_one(&mut self, id: JobId, tube_name: &TubeName, now: Instant) {
        let Some(job) = self.jobs.get(&id) else { return };
        let pri = job.priority;
        let ttr_secs = job.ttr.as_secs() as u32;
        if let Some(wal) = &mut self.wal {
            let _ = wal.record_update(id.get(), pri, 0, ttr_secs, RecordState::Ready);
        }
        if let Some(job) = self.jobs.get_mut(&id) {
            job.state = JobState::Ready;
            job.kick_count += 1;
            job.deadline_at = now;
        }
        Self::ready_push(&mut self.tubes, &mut self.jobs, tube_name, id, pri);
    }

    fn kick(&mut self, conn_id: ConnId, bound: u64, now: Instant) -> u64 {
        self.counters.cmd_kick += 1;
        let Some(conn) = self.conns.get(&conn_id) else { return 0 };
        let tube_name = conn.used.clone();
        let mut kicked = 0u64;

        while kicked < bound {
            let Some(tube) = self.tubes.get_mut(&tube_name) else { break };
            let Some(id) = tube.bury_pop_front() else { break };
            self.kick_one(id, &tube_name, now);
            kicked += 1;
        }

        if kicked == 0 {
            while kicked < bound {
                let Some(id) = Self::delayed_pop(&mut self.tubes, &mut self.jobs, &tube_name) else { break };
                self.kick_one(id, &tube_name, now);
                kicked += 1;
            }
        }

        kicked
    }

    fn kick_job(&mut self, raw_id: u64, now: Instant) -> Response {
        self.counters.cmd_kick += 1;
        let Some(id) = JobId::new(raw_id) else { return Response::NotFound };
        let Some(job) = self.jobs.get(&id) else { return Response::NotFound };
        let tube_name = job.tube.clone();

        match job.state {
            JobState::Buried => {
                if let Some(tube) = self.tubes.get_mut(&tube_name) {
                    tube.bury_remove(id);
                }
                self.kick_one(id, &tube_name, now);
                Response::Kicked
            },
            JobState::Delayed => {
                let pos = job.delayed_pos;
                if let Some(pos) = pos {
                    Self::delayed_remove(&mut self.tubes, &mut self.jobs, &tube_name, pos);
                }
                self.kick_one(id, &tube_name, now);
                Response::Kicked
            },
            _ => Response::NotFound,
        }
    }

    fn stats_job(&self, raw_id: u64, now: Instant) -> Option<JobStats> {
        let id = JobId::new(raw_id)?;
        let job = self.jobs.get(&id)?;
        let age = now.saturating_duration_since(job.created_at).as_secs() as u32;
        let (delay, time_left) = match job.state {
            JobState::Delayed => (
                job.delay.as_secs() as u32,
                job.deadline_at.saturating_duration_since(now).as_secs() as u32,
            ),
            JobState::Reserved => (0, job.deadline_at.saturating_duration_since(now).as_secs() as u32),
            _ => (0, 0),
        };
        Some(JobStats {
            id: raw_id,
            tube: job.tube.as_bytes().to_vec(),
            state: job.state,
            pri: job.priority,
            age,
            delay,
            ttr: job.ttr.as_secs() as u32,
            time_left,
            file: job.wal_file,
            reserves: job.reserve_count,
            timeouts: job.timeout_count,
            releases: job.release_count,
            buries: job.bury_count,
            kicks: job.kick_count,
        })
    }

    fn stats_tube(&self, raw_tube: &[u8], now: Instant) -> Option<TubeStatsResp> {
        let name = TubeName::parse(raw_tube)?;
        let tube = self.tubes.get(&name)?;
        let mut ts = tube.stats.clone();
        ts.current_jobs_reserved = self
            .jobs
            .values()
            .filter(|job| job.tube == name && job.state == JobState::Reserved)
            .count() as u64;
        ts.current_using = tube.use_count;
        ts.current_watching = tube.watch_count;
        ts.current_waiting = tube.waiting.iter().filter(|id| self.conns[id].waiting.is_some()).count() as u64;
        let pause_time_left = match tube.paused_until {
            Some(until) if until > now => until.saturating_duration_since(now).as_secs() as u32,
            _ => 0,
        };
        Some(TubeStatsResp { name: name.as_bytes().to_vec(), ts, pause_time_left })
    }

    fn stats_server(&self, now: Instant) -> ServerStats {
        let mut stats = ServerStats::default();

        for tube in self.tubes.values() {
            stats.current_jobs_urgent += tube.stats.current_jobs_urgent;
            stats.current_jobs_ready += tube.stats.current_jobs_ready;
            stats.current_jobs_delayed += tube.stats.current_jobs_delayed;
            stats.current_jobs_buried += tube.stats.current_jobs_buried;
        }
        stats.current_jobs_reserved =
            self.jobs.values().filter(|job| job.state == JobState::Reserved).count() as u64;

        stats.cmd_put = self.counters.cmd_put;
        stats.cmd_peek = self.counters.cmd_peek;
        stats.cmd_peek_ready = self.counters.cmd_peek_ready;
        stats.cmd_peek_delayed = self.counters.cmd_peek_delayed;
        stats.cmd_peek_buried = self.counters.cmd_peek_buried;
        stats.cmd_reserve = self.counters.cmd_reserve;
        stats.cmd_reserve_with_timeout = self.counters.cmd_reserve_with_timeout;
        stats.cmd_touch = self.counters.cmd_touch;
        stats.cmd_use = self.counters.cmd_use;
        stats.cmd_watch = self.counters.cmd_watch;
        stats.cmd_ignore = self.counters.cmd_ignore;
        stats.cmd_delete = self.counters.cmd_delete;
        stats.cmd_release = self.counters.cmd_release;
        stats.cmd_bury = self.counters.cmd_bury;
        stats.cmd_kick = self.counters.cmd_kick;
        stats.cmd_stats = self.counters.cmd_stats;
        stats.cmd_stats_job = self.counters.cmd_stats_job;
        stats.cmd_stats_tube = self.counters.cmd_stats_tube;
        stats.cmd_list_tubes = self.counters.cmd_list_tubes;
        stats.cmd_list_tube_used = self.counters.cmd_list_tube_used;
        stats.cmd_list_tubes_watched = self.counters.cmd_list_tubes_watched;
        stats.cmd_pause_tube = self.counters.cmd_pause_tube;

        stats.job_timeouts = self.counters.job_timeouts;
        stats.total_jobs = self.counters.total_jobs;
        stats.max_job_size = self.max_job_size as u64;
        stats.current_tubes = self.tubes.len() as u64;
        stats.current_connections = self.conns.len() as u64;
        stats.current_producers = self.conns.values().filter(|c| c.is_producer).count() as u64;
        stats.current_workers = self.conns.values().filter(|c| c.is_worker).count() as u64;
        stats.current_waiting = self.conns.values().filter(|c| c.waiting.is_some()).count() as u64;
        stats.total_connections = self.counters.total_connections;
        stats.pid = std::process::id();
        stats.version = env!("CARGO_PKG_VERSION");
        stats.rusage_utime = 0;
        stats.rusage_stime = 0;
        stats.uptime = now.saturating_duration_since(self.start_time).as_secs() as u32;

        if let Some(wal) = &self.wal {
            let ws = wal.stats();
            stats.binlog_oldest_index = ws.oldest_index;
            stats.binlog_current_index = ws.current_index;
            stats.binlog_max_size = ws.max_size;
            stats.binlog_records_written = ws.records_written;
            stats.binlog_records_migrated = ws.records_migrated;
        }

        stats.draining = self.draining;
        stats.id = self.server_id.clone().into_bytes();
        let (hostname, os, platform) = uname_info();
        stats.hostname = hostname;
        stats.os = os;
        stats.platform = platform;

        stats
    }

    fn list_tubes(&self) -> Vec<Vec<u8>> {
        let mut names: Vec<Vec<u8>> = self.tubes.keys().map(|n| n.as_bytes().to_vec()).collect();
        names.sort();
        names
    }

    fn list_tube_used(&self, conn_id: ConnId) -> Vec<u8> {
        self.conns.get(&conn_id).map(|c| c.used.as_bytes().to_vec()).unwrap_or_default()
    }

    fn list_tubes_watched(&self, conn_id: ConnId) -> Vec<Vec<u8>> {
        self.conns
            .get(&conn_id)
            .map(|c| c.watched.iter().map(|n| n.as_bytes().to_vec()).collect())
            .unwrap_or_default()
    }

    fn pause_tube(&mut self, raw_tube: &[u8], delay: u32, now: Instant) -> Response {
        self.counters.cmd_pause_tube += 1;
        let Some(name) = TubeName::parse(raw_tube) else { return Response::BadFormat };
        let Some(tube) = self.tubes.get_mut(&name) else { return Response::NotFound };
        tube.paused_until = Some(now + Duration::from_secs(delay as u64));
        tube.stats.cmd_pause_tube += 1;
        tube.stats.pause += delay;
        Response::Paused
    }

    // --- scheduler ---

    fn pop_live_waiter(
        tubes: &mut HashMap<TubeName, Tube>,
        conns: &HashMap<ConnId, ConnState>,
        tube_name: &TubeName,
    ) -> Option<ConnId> {
        let tube = tubes.get_mut(tube_name)?;
        while let Some(conn_id) = tube.waiting.pop_front() {
            if conns.get(&conn_id).is_some_and(|c| c.waiting.is_some()) {
                return Some(conn_id);
            }
        }
        None
    }

    fn expire_reservation(&mut self, id: JobId, now: Instant) {
        let Some(job) = self.jobs.get(&id) else { return };
        let tube_name = job.tube.clone();
        let pri = job.priority;
        let ttr_secs = job.ttr.as_secs() as u32;

        if let Some(conn_id) = job.reserved_by {
            if let Some(conn) = self.conns.get_mut(&conn_id) {
                conn.reserved.remove(&id);
            }
            self.recompute_soonest_deadline(conn_id);
        }

        if let Some(wal) = &mut self.wal {
            let _ = wal.record_update(id.get(), pri, 0, ttr_secs, RecordState::Ready);
        }

        if let Some(job) = self.jobs.get_mut(&id) {
            job.state = JobState::Ready;
            job.reserved_by = None;
            job.timeout_count += 1;
            job.deadline_at = now;
        }

        self.counters.job_timeouts += 1;
        Self::ready_push(&mut self.tubes, &mut self.jobs, &tube_name, id, pri);
    }

    /// Advances time: promotes due delayed jobs, expires timed-out
    /// reservations, lifts expired pauses, dispatches newly-ready jobs to
    /// waiting connections, and resolves `DEADLINE_SOON`/`TIMED_OUT` for
    /// connections still blocked in `reserve`. Returns replies the caller
    /// (the server's connection tasks) must deliver.
    pub fn tick(&mut self, now: Instant) -> Vec<(ConnId, Outcome)> {
        let mut out = Vec::new();
        let tube_names: Vec<TubeName> = self.tubes.keys().cloned().collect();

        for name in &tube_names {
            loop {
                let due = self
                    .tubes
                    .get(name)
                    .and_then(|t| t.delayed_peek_deadline())
                    .is_some_and(|d| d <= now);
                if !due {
                    break;
                }
                let Some(id) = Self::delayed_pop(&mut self.tubes, &mut self.jobs, name) else { break };
                let pri = match self.jobs.get_mut(&id) {
                    Some(job) => {
                        job.state = JobState::Ready;
                        job.priority
                    },
                    None => continue,
                };
                if let Some(wal) = &mut self.wal {
                    let ttr_secs = self.jobs[&id].ttr.as_secs() as u32;
                    let _ = wal.record_update(id.get(), pri, 0, ttr_secs, RecordState::Ready);
                }
                Self::ready_push(&mut self.tubes, &mut self.jobs, name, id, pri);
            }
        }

        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.state == JobState::Reserved && job.deadline_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.expire_reservation(id, now);
        }

        for name in &tube_names {
            if let Some(tube) = self.tubes.get_mut(name) {
                if tube.paused_until.is_some_and(|until| until <= now) {
                    tube.paused_until = None;
                }
            }
        }

        for name in &tube_names {
            loop {
                let has_ready = self
                    .tubes
                    .get(name)
                    .is_some_and(|t| !t.is_paused(now) && t.ready_peek().is_some());
                if !has_ready {
                    break;
                }
                let Some(conn_id) = Self::pop_live_waiter(&mut self.tubes, &self.conns, name) else { break };
                match self.dispatch_ready_job(conn_id, now) {
                    Some(id) => {
                        let body = self.jobs[&id].body.clone();
                        out.push((conn_id, Outcome::Job { id: id.get(), body, kind: JobKind::Reserved }));
                    },
                    None => break,
                }
            }
        }

        let conn_ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for conn_id in conn_ids {
            let Some(conn) = self.conns.get(&conn_id) else { continue };
            let Some(waiting) = conn.waiting else { continue };
            if conn.soonest_deadline_at.is_some_and(|soonest| soonest <= now) {
                self.clear_waiting(conn_id);
                out.push((conn_id, Outcome::Reply(Response::DeadlineSoon)));
                continue;
            }
            if waiting.deadline.is_some_and(|d| d <= now) {
                self.clear_waiting(conn_id);
                out.push((conn_id, Outcome::Reply(Response::TimedOut)));
            }
        }

        self.collect_tube_garbage();
        out
    }

    /// The earliest instant at which [`Engine::tick`] could produce a new
    /// reply, used by the server loop to size its next `sleep_until`.
    pub fn next_wake(&self) -> Option<Instant> {
        let mut wake: Option<Instant> = None;
        let mut consider = |t: Instant| wake = Some(wake.map_or(t, |w: Instant| w.min(t)));

        let now = Instant::now();
        for tube in self.tubes.values() {
            if let Some(d) = tube.delayed_peek_deadline() {
                consider(d);
            }
            if let Some(until) = tube.paused_until {
                consider(until);
            }
            // An unpaused tube holding both a ready job and a live waiter
            // needs dispatching right away; the server loop otherwise has
            // no timer deadline to wake it on.
            if !tube.is_paused(now)
                && tube.ready_peek().is_some()
                && tube.waiting.iter().any(|id| self.conns.get(id).is_some_and(|c| c.waiting.is_some()))
            {
                consider(now);
            }
        }
        for job in self.jobs.values() {
            if job.state == JobState::Reserved {
                consider(job.deadline_at);
            }
        }
        for conn in self.conns.values() {
            if let Some(waiting) = conn.waiting {
                if let Some(d) = waiting.deadline {
                    consider(d);
                }
                if let Some(soonest) = conn.soonest_deadline_at {
                    consider(soonest);
                }
            }
        }
        wake
    }
}
