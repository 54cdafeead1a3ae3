//! Stop-and-wait batch scheduling for nonce search algorithms.
//!
//! One batch is in flight at a time. A tick either dispatches a batch (upload
//! header and target, reset the candidate counter, run every kernel, request a
//! non-blocking read of the candidates) or checks whether the outstanding
//! read has completed. The read's signal is the only thing the host waits on.

use std::fmt;
use std::sync::Arc;

use clkvc_oracle::{Header, HEADER_LEN};
use tracing::{debug, trace, warn};

use crate::algorithm::{AlgorithmInstance, AlgorithmTable};
use crate::backend::{AllocationKind, AllocationRequest, BackendError, ComputeBackend, MemFlags, SignalId};
use crate::error::{AllocationFailure, CheckError, CheckResult};
use crate::kernels::KernelSourceProvider;
use crate::nonce::{MinedNonces, NonceWindow};
use crate::special::{SpecialBinding, SpecialValueResolver, CANDIDATES, DISPATCH_DATA, WORK_DATA};

const DISPATCH_WORDS: usize = 5;
const MIN_CANDIDATE_SLOTS: usize = 32;

/// Candidate slots reserved for a batch of `batch` hashes.
pub fn candidate_slots(batch: usize) -> usize {
    MIN_CANDIDATE_SLOTS.max(batch / 32768)
}

/// The three host-provided buffers of a search algorithm.
pub struct StopWaitResources<M> {
    work_data: M,
    dispatch_data: M,
    candidates: M,
    slots: usize,
}

impl<M> StopWaitResources<M> {
    pub fn allocate<B: ComputeBackend<Memory = M>>(backend: &B, slots: usize) -> CheckResult<Self> {
        let buffer = |name: &str, bytes: usize, flags: MemFlags| {
            backend
                .allocate(&AllocationRequest {
                    name,
                    flags,
                    kind: AllocationKind::Buffer { bytes },
                    initial: None,
                })
                .map_err(|err| CheckError::Allocation {
                    name: name.to_string(),
                    failure: err.into(),
                })
        };
        Ok(Self {
            work_data: buffer(WORK_DATA, HEADER_LEN, MemFlags::READ_ONLY)?,
            dispatch_data: buffer(DISPATCH_DATA, DISPATCH_WORDS * 4, MemFlags::READ_ONLY)?,
            candidates: buffer(CANDIDATES, (1 + slots) * 4, MemFlags::READ_WRITE)?,
            slots,
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Counter word plus every slot.
    pub fn candidate_bytes(&self) -> usize {
        (1 + self.slots) * 4
    }
}

impl<M> SpecialValueResolver<M> for StopWaitResources<M> {
    fn resolve(&self, name: &str) -> Option<SpecialBinding<'_, M>> {
        match name {
            WORK_DATA => Some(SpecialBinding::Early(&self.work_data)),
            DISPATCH_DATA => Some(SpecialBinding::Early(&self.dispatch_data)),
            CANDIDATES => Some(SpecialBinding::Early(&self.candidates)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Ready,
    Dispatched,
    Exhausted,
    ResultsReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Dispatched { signal: SignalId },
    Working,
    Exhausted,
    ResultsReady,
}

/// Handle to the batch a `submit` call put in flight.
#[derive(Debug, PartialEq, Eq)]
pub struct BatchTicket {
    serial: u64,
}

impl fmt::Display for BatchTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch {}", self.serial)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Submission {
    Pending(BatchTicket),
    Exhausted,
}

struct InFlight<S> {
    signal: S,
    id: SignalId,
    serial: u64,
    origin: Header,
    first_nonce: u32,
}

pub struct StopWaitScheduler<B: ComputeBackend> {
    backend: Arc<B>,
    algorithm: AlgorithmInstance<B>,
    io: StopWaitResources<B::Memory>,
    batch: usize,
    window: NonceWindow,
    state: SchedulerState,
    in_flight: Option<InFlight<B::Signal>>,
    serial: u64,
    queue: B::Queue,
}

impl<B: ComputeBackend> StopWaitScheduler<B> {
    pub fn new(
        backend: Arc<B>,
        table: &AlgorithmTable,
        sources: &dyn KernelSourceProvider,
        batch: usize,
    ) -> CheckResult<Self> {
        if batch == 0 {
            return Err(CheckError::Protocol("batch size must not be zero".to_string()));
        }
        let queue = backend.create_queue().map_err(|err| CheckError::Allocation {
            name: "command queue".to_string(),
            failure: AllocationFailure::Backend(err),
        })?;
        let io = StopWaitResources::allocate(backend.as_ref(), candidate_slots(batch))?;
        let algorithm = AlgorithmInstance::build(Arc::clone(&backend), table, sources, &io)?;
        debug!(
            algorithm = %algorithm.identity(),
            signature = %algorithm.signature(),
            batch,
            slots = io.slots(),
            "scheduler ready"
        );
        Ok(Self {
            backend,
            algorithm,
            io,
            batch,
            window: NonceWindow::default(),
            state: SchedulerState::Ready,
            in_flight: None,
            serial: 0,
            queue,
        })
    }

    pub fn algorithm(&self) -> &AlgorithmInstance<B> {
        &self.algorithm
    }

    pub fn queue(&self) -> &B::Queue {
        &self.queue
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn nonce_base(&self) -> u64 {
        self.window.nonce_base()
    }

    pub fn header(&self) -> &Header {
        self.window.header()
    }

    pub fn target(&self) -> u64 {
        self.window.target()
    }

    /// Leaves any batch in flight alone; its results keep their own header.
    pub fn set_header(&mut self, header: Header) {
        self.window.set_header(header);
    }

    pub fn set_target(&mut self, target: u64) {
        self.window.set_target(target);
    }

    /// Moves the next batch's first nonce without touching header or target.
    pub fn seek(&mut self, nonce_base: u64) {
        self.window.seek(nonce_base);
    }

    pub fn tick(&mut self, triggered: &[SignalId]) -> CheckResult<TickOutcome> {
        if let Some(in_flight) = &self.in_flight {
            if triggered.contains(&in_flight.id) {
                if self.state != SchedulerState::ResultsReady {
                    trace!(signal = %in_flight.id, "batch results ready");
                }
                self.state = SchedulerState::ResultsReady;
                return Ok(TickOutcome::ResultsReady);
            }
            return Ok(match self.state {
                SchedulerState::ResultsReady => TickOutcome::ResultsReady,
                _ => TickOutcome::Working,
            });
        }

        if self.window.would_exhaust(self.batch) {
            if self.state != SchedulerState::Exhausted {
                debug!(
                    algorithm = %self.algorithm.identity().presentation(),
                    nonce_base = self.window.nonce_base(),
                    "nonce space exhausted"
                );
            }
            self.state = SchedulerState::Exhausted;
            return Ok(TickOutcome::Exhausted);
        }

        let signal = self.dispatch()?;
        Ok(TickOutcome::Dispatched { signal })
    }

    fn dispatch(&mut self) -> CheckResult<SignalId> {
        let presentation = self.algorithm.identity().presentation();
        let transfer = |what: &'static str| {
            let algorithm = presentation.clone();
            move |source: BackendError| CheckError::Transfer {
                algorithm,
                what,
                source,
            }
        };

        let origin = *self.window.header();
        let uploaded = self.algorithm.byte_order().apply(&origin);
        self.backend
            .write_blocking(&self.queue, &mut self.io.work_data, 0, &uploaded)
            .map_err(transfer("header upload"))?;
        let dispatch_words = dispatch_words(self.window.target(), self.io.slots());
        self.backend
            .write_blocking(&self.queue, &mut self.io.dispatch_data, 0, &dispatch_words)
            .map_err(transfer("target upload"))?;
        self.backend
            .write_blocking(&self.queue, &mut self.io.candidates, 0, &0u32.to_le_bytes())
            .map_err(transfer("candidate counter reset"))?;

        let first_nonce = self.window.first_nonce().ok_or_else(|| {
            CheckError::Protocol(format!("nonce base {} is outside the nonce space", self.window.nonce_base()))
        })?;
        self.algorithm
            .run_iteration(&self.queue, first_nonce, self.batch, &[])?;
        self.window.advance(self.batch);

        let signal = self
            .backend
            .enqueue_read(&self.queue, &self.io.candidates, self.io.candidate_bytes())
            .map_err(transfer("candidate read"))?;
        let id = self.backend.signal_id(&signal);
        self.serial += 1;
        self.in_flight = Some(InFlight {
            signal,
            id,
            serial: self.serial,
            origin,
            first_nonce,
        });
        self.state = SchedulerState::Dispatched;
        trace!(algorithm = %presentation, first_nonce, signal = %id, "batch dispatched");
        Ok(id)
    }

    pub fn pending_signals(&self, out: &mut Vec<SignalId>) {
        if let Some(in_flight) = &self.in_flight {
            out.push(in_flight.id);
        }
    }

    /// Blocks until the outstanding read completes and returns the signals
    /// that fired, ready to be fed back into `tick`.
    pub fn wait_pending(&self) -> CheckResult<Vec<SignalId>> {
        let Some(in_flight) = &self.in_flight else {
            return Ok(Vec::new());
        };
        self.backend
            .wait(&[&in_flight.signal])
            .map_err(|source| CheckError::Transfer {
                algorithm: self.algorithm.identity().presentation(),
                what: "candidate read",
                source,
            })?;
        Ok(vec![in_flight.id])
    }

    pub fn collect_results(&mut self) -> CheckResult<MinedNonces> {
        if self.state != SchedulerState::ResultsReady {
            return Err(CheckError::Protocol(format!(
                "results collected in state {:?}",
                self.state
            )));
        }
        let in_flight = self
            .in_flight
            .take()
            .ok_or_else(|| CheckError::Protocol("no batch in flight".to_string()))?;
        self.state = SchedulerState::Ready;

        let presentation = self.algorithm.identity().presentation();
        let bytes = self
            .backend
            .take_read(in_flight.signal)
            .map_err(|source| CheckError::Transfer {
                algorithm: presentation.clone(),
                what: "candidate read",
                source,
            })?;
        let (reported, nonces) = parse_candidates(&bytes)?;
        if reported as usize > nonces.len() {
            warn!(
                algorithm = %presentation,
                reported,
                capacity = nonces.len(),
                "candidate buffer overflowed, keeping the stored nonces"
            );
        }
        Ok(MinedNonces {
            origin: in_flight.origin,
            first_nonce: in_flight.first_nonce,
            batch: self.batch,
            nonces,
            reported,
        })
    }

    pub fn submit(&mut self) -> CheckResult<Submission> {
        if let Some(in_flight) = &self.in_flight {
            return Err(CheckError::Protocol(format!(
                "batch {} is still outstanding",
                in_flight.serial
            )));
        }
        match self.tick(&[])? {
            TickOutcome::Exhausted => Ok(Submission::Exhausted),
            _ => Ok(Submission::Pending(BatchTicket {
                serial: self.serial,
            })),
        }
    }

    /// Non-blocking: the batch's nonces once its read completed.
    pub fn poll(&mut self, ticket: &BatchTicket) -> CheckResult<Option<MinedNonces>> {
        let in_flight = self.check_ticket(ticket)?;
        let complete = self
            .backend
            .is_complete(&in_flight.signal)
            .map_err(|source| CheckError::Transfer {
                algorithm: self.algorithm.identity().presentation(),
                what: "candidate read",
                source,
            })?;
        if !complete {
            return Ok(None);
        }
        let id = in_flight.id;
        self.tick(&[id])?;
        self.collect_results().map(Some)
    }

    pub fn await_ready(&mut self, ticket: BatchTicket) -> CheckResult<MinedNonces> {
        self.check_ticket(&ticket)?;
        let triggered = self.wait_pending()?;
        self.tick(&triggered)?;
        self.collect_results()
    }

    fn check_ticket(&self, ticket: &BatchTicket) -> CheckResult<&InFlight<B::Signal>> {
        match &self.in_flight {
            Some(in_flight) if in_flight.serial == ticket.serial => Ok(in_flight),
            _ => Err(CheckError::Protocol(format!("{ticket} is not outstanding"))),
        }
    }
}

/// `[0, target high word, target low word, candidate capacity, 0]`, little-endian.
fn dispatch_words(target: u64, slots: usize) -> Vec<u8> {
    let words: [u32; DISPATCH_WORDS] = [0, (target >> 32) as u32, target as u32, slots as u32, 0];
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

fn parse_candidates(bytes: &[u8]) -> CheckResult<(u32, Vec<u32>)> {
    if bytes.len() < 4 {
        return Err(CheckError::Protocol(format!(
            "candidate buffer holds {} bytes",
            bytes.len()
        )));
    }
    let (counter, slots) = bytes.split_at(4);
    let reported = u32::from_le_bytes([counter[0], counter[1], counter[2], counter[3]]);
    let stored = (reported as usize).min(slots.len() / 4);
    let nonces = slots
        .chunks_exact(4)
        .take(stored)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok((reported, nonces))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms;
    use crate::backend::emulated::EmulatedDevice;
    use crate::kernels::EmbeddedSources;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    const BATCH: usize = 4096;
    const TARGET: u64 = u64::MAX >> 11;

    fn random_header(seed: u64) -> Header {
        let mut header = [0u8; HEADER_LEN];
        StdRng::seed_from_u64(seed).fill_bytes(&mut header);
        header
    }

    fn scheduler(table: &AlgorithmTable) -> StopWaitScheduler<EmulatedDevice> {
        StopWaitScheduler::new(Arc::new(EmulatedDevice::new("test")), table, &EmbeddedSources, BATCH)
            .expect("scheduler should build")
    }

    fn run_batch(scheduler: &mut StopWaitScheduler<EmulatedDevice>) -> MinedNonces {
        let outcome = scheduler.tick(&[]).expect("tick should dispatch");
        assert!(matches!(outcome, TickOutcome::Dispatched { .. }), "{outcome:?}");
        let triggered = scheduler.wait_pending().expect("wait should succeed");
        assert_eq!(
            scheduler.tick(&triggered).expect("tick should see the signal"),
            TickOutcome::ResultsReady
        );
        scheduler.collect_results().expect("results should collect")
    }

    #[test]
    fn candidate_slots_have_a_floor() {
        assert_eq!(candidate_slots(4096), 32);
        assert_eq!(candidate_slots(1 << 24), 512);
    }

    #[test]
    fn dispatch_words_split_the_target() {
        let bytes = dispatch_words(0x1122_3344_5566_7788, 32);
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[4..8], &0x1122_3344u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x5566_7788u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &32u32.to_le_bytes());
    }

    #[test]
    fn dispatch_words_carry_the_candidate_capacity_in_word_three() {
        let bytes = dispatch_words(u64::MAX >> 11, candidate_slots(1 << 24));
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
            .collect();
        assert_eq!(words, [0, (u64::MAX >> 43) as u32, u32::MAX, 512, 0]);
    }

    #[test]
    fn both_search_layouts_find_the_reference_nonces() {
        let header = random_header(1);
        let expected = clkvc_oracle::sha256d_scan(&header, TARGET, 0, BATCH as u32);
        for table in [algorithms::sha256d_monolithic(BATCH), algorithms::sha256d_two_stage(BATCH)] {
            let mut scheduler = scheduler(&table);
            scheduler.set_header(header);
            scheduler.set_target(TARGET);
            let mined = run_batch(&mut scheduler);
            let mut found = mined.nonces.clone();
            found.sort_unstable();
            assert_eq!(found, expected, "{}", table.identity);
            assert_eq!(mined.first_nonce, 0);
            assert_eq!(scheduler.nonce_base(), BATCH as u64);
            assert_eq!(scheduler.state(), SchedulerState::Ready);
        }
    }

    #[test]
    fn outstanding_batch_reports_working_until_its_signal_fires() {
        let mut scheduler = scheduler(&algorithms::sha256d_monolithic(BATCH));
        let TickOutcome::Dispatched { signal } = scheduler.tick(&[]).expect("tick should dispatch") else {
            panic!("first tick should dispatch");
        };
        let mut pending = Vec::new();
        scheduler.pending_signals(&mut pending);
        assert_eq!(pending, [signal]);
        assert_eq!(scheduler.tick(&[]).expect("tick should succeed"), TickOutcome::Working);
        assert_eq!(
            scheduler.tick(&[SignalId(signal.0 + 1000)]).expect("tick should succeed"),
            TickOutcome::Working
        );
        assert!(matches!(scheduler.collect_results(), Err(CheckError::Protocol(_))));
        scheduler.wait_pending().expect("wait should succeed");
        assert_eq!(scheduler.tick(&[signal]).expect("tick should succeed"), TickOutcome::ResultsReady);
        scheduler.collect_results().expect("results should collect");
        assert!(matches!(scheduler.collect_results(), Err(CheckError::Protocol(_))));
    }

    #[test]
    fn results_keep_the_header_they_were_dispatched_with() {
        let (first, second) = (random_header(2), random_header(3));
        let mut scheduler = scheduler(&algorithms::sha256d_monolithic(BATCH));
        scheduler.set_target(TARGET);
        scheduler.set_header(first);
        scheduler.tick(&[]).expect("tick should dispatch");
        scheduler.set_header(second);
        assert_eq!(scheduler.nonce_base(), 0);

        let triggered = scheduler.wait_pending().expect("wait should succeed");
        scheduler.tick(&triggered).expect("tick should succeed");
        let stale = scheduler.collect_results().expect("stale results should collect");
        assert_eq!(stale.origin, first);
        let mut found = stale.nonces;
        found.sort_unstable();
        assert_eq!(found, clkvc_oracle::sha256d_scan(&first, TARGET, 0, BATCH as u32));

        let fresh = run_batch(&mut scheduler);
        assert_eq!(fresh.origin, second);
    }

    #[test]
    fn refuses_batches_past_the_end_of_the_nonce_space() {
        let mut scheduler = scheduler(&algorithms::sha256d_monolithic(BATCH));
        scheduler.seek(u64::from(u32::MAX) - BATCH as u64 + 1);
        assert_eq!(scheduler.tick(&[]).expect("tick should succeed"), TickOutcome::Exhausted);
        assert_eq!(scheduler.state(), SchedulerState::Exhausted);

        scheduler.seek(u64::from(u32::MAX) - 2 * BATCH as u64 + 1);
        let mined = run_batch(&mut scheduler);
        assert_eq!(mined.first_nonce, u32::MAX - 2 * BATCH as u32 + 1);
        assert_eq!(scheduler.tick(&[]).expect("tick should succeed"), TickOutcome::Exhausted);

        scheduler.set_header(random_header(4));
        assert!(matches!(
            scheduler.tick(&[]).expect("tick should dispatch"),
            TickOutcome::Dispatched { .. }
        ));
    }

    #[test]
    fn overflowing_candidates_are_clamped() {
        let mut scheduler = scheduler(&algorithms::sha256d_monolithic(BATCH));
        scheduler.set_target(u64::MAX);
        let mined = run_batch(&mut scheduler);
        assert_eq!(mined.reported, BATCH as u32);
        assert_eq!(mined.nonces.len(), candidate_slots(BATCH));
        assert!(mined.overflowed());
    }

    #[test]
    fn ticket_api_tracks_the_outstanding_batch() {
        let header = random_header(5);
        let mut scheduler = scheduler(&algorithms::sha256d_two_stage(BATCH));
        scheduler.set_header(header);
        scheduler.set_target(TARGET);

        let Submission::Pending(ticket) = scheduler.submit().expect("submit should succeed") else {
            panic!("fresh scheduler should not be exhausted");
        };
        assert!(matches!(scheduler.submit(), Err(CheckError::Protocol(_))));
        assert!(matches!(
            scheduler.poll(&BatchTicket { serial: 99 }),
            Err(CheckError::Protocol(_))
        ));
        let mined = scheduler.await_ready(ticket).expect("batch should complete");
        let mut found = mined.nonces;
        found.sort_unstable();
        assert_eq!(found, clkvc_oracle::sha256d_scan(&header, TARGET, 0, BATCH as u32));

        let Submission::Pending(ticket) = scheduler.submit().expect("submit should succeed") else {
            panic!("second batch should dispatch");
        };
        let mined = loop {
            if let Some(mined) = scheduler.poll(&ticket).expect("poll should succeed") {
                break mined;
            }
            std::thread::yield_now();
        };
        assert_eq!(mined.first_nonce, BATCH as u32);

        scheduler.seek(u64::from(u32::MAX));
        assert_eq!(scheduler.submit().expect("submit should succeed"), Submission::Exhausted);
        scheduler.seek(1 << 40);
        assert_eq!(scheduler.submit().expect("submit should succeed"), Submission::Exhausted);
    }
}
