//! Background worker that serializes DFU jobs.
//!
//! Every public call on [`DfuEngine`] enqueues one job for a single worker
//! thread and returns a oneshot receiver for its result. Jobs run strictly in
//! submission order against the shared transport; status events go to the
//! sink passed to [`DfuEngine::new`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::error::{DfuError, DfuResult};
use super::events::DfuEvent;
use super::firmware_reader::{parse_dfu_image, read_dfu_file, FirmwareImage};
use super::programmer::{OptionBytes, Outcome, Programmer};
use super::protocol::DfuProtocol;
use super::transport::{DfuTransport, SharedTransport};
use crate::settings::ProgrammerSettings;
use crate::traits::BootPins;

/// Completion handle for a queued job.
pub type JobReceiver<R> = oneshot::Receiver<DfuResult<R>>;

type EventSink = Arc<dyn Fn(DfuEvent) + Send + Sync>;

trait Job: Send {
    fn run(self: Box<Self>, worker: &mut Worker);

    /// Complete the job without running it.
    fn reject(self: Box<Self>, error: DfuError);
}

struct Task<R, F> {
    name: &'static str,
    /// Cancel generation at submission.
    generation: u64,
    work: F,
    reply: oneshot::Sender<DfuResult<R>>,
}

impl<R, F> Job for Task<R, F>
where
    R: Send + 'static,
    F: FnOnce(&mut Worker) -> DfuResult<R> + Send + 'static,
{
    fn run(self: Box<Self>, worker: &mut Worker) {
        let Task {
            name,
            generation,
            work,
            reply,
        } = *self;
        let result = worker.execute(name, generation, work);
        // The caller may have dropped its receiver
        let _ = reply.send(result);
    }

    fn reject(self: Box<Self>, error: DfuError) {
        let _ = self.reply.send(Err(error));
    }
}

/// State owned by the worker thread.
struct Worker {
    transport: SharedTransport,
    settings: ProgrammerSettings,
    image: Option<FirmwareImage>,
    cancel: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    events: EventSink,
    boot_pins: Option<Box<dyn BootPins>>,
}

impl Worker {
    fn emit(&self, event: DfuEvent) {
        (self.events)(event);
    }

    fn execute<R>(
        &mut self,
        name: &'static str,
        generation: u64,
        work: impl FnOnce(&mut Worker) -> DfuResult<R>,
    ) -> DfuResult<R> {
        // Must precede the generation check
        self.cancel.store(false, Ordering::SeqCst);
        let result = if generation != self.generation.load(Ordering::SeqCst) {
            Err(DfuError::Interrupted)
        } else {
            log::debug!("Running {} job", name);
            work(self)
        };

        if let Err(e) = &result {
            log::error!("{} failed: {}", name, e);
            self.emit(DfuEvent::Failed {
                message: e.to_string(),
                code: e.error_code().to_string(),
            });
        }
        result
    }

    /// Build a programmer over the current transport.
    fn programmer(&self) -> DfuResult<Programmer<SharedTransport, Box<dyn Fn(DfuEvent) + Send>>> {
        if !self.transport.is_connected() {
            return Err(DfuError::NotConnected);
        }

        let protocol = DfuProtocol::new(self.transport.clone())
            .with_cancel(Arc::clone(&self.cancel))
            .with_max_polls(self.settings.max_status_polls);
        let events = Arc::clone(&self.events);
        let sink: Box<dyn Fn(DfuEvent) + Send> = Box::new(move |event| events(event));

        Ok(Programmer::new(protocol, sink)
            .with_max_retries(self.settings.max_retries)
            .with_blank_check(self.settings.blank_check)
            .with_option_bytes(self.settings.option_bytes))
    }

    fn image(&self) -> DfuResult<&FirmwareImage> {
        self.image.as_ref().ok_or(DfuError::NoImageLoaded)
    }

    fn load(&mut self, image: FirmwareImage) -> FirmwareImage {
        log::info!(
            "Loaded \"{}\": {} bytes at 0x{:08X}",
            image.target_name,
            image.element_length,
            image.element_address
        );
        self.emit(DfuEvent::FileVerified {
            target_name: image.target_name.clone(),
            size: image.element_length,
            address: image.element_address,
            sha256: image.sha256_hex(),
        });
        self.image = Some(image.clone());
        image
    }

    /// Forget the transport of a device that has reset itself.
    fn device_gone(&self) {
        log::info!("Device is resetting, dropping transport");
        self.transport.revoke();
    }

    fn boot_pins(&mut self) -> DfuResult<&mut dyn BootPins> {
        match self.boot_pins.as_mut() {
            Some(pins) => Ok(pins.as_mut()),
            None => Err(DfuError::BootControl {
                reason: "No boot pin controller attached".into(),
            }),
        }
    }
}

fn run_worker(mut worker: Worker, jobs: mpsc::Receiver<Box<dyn Job>>) {
    // Ends once every sender is gone and the queue is drained
    while let Ok(job) = jobs.recv() {
        job.run(&mut worker);
    }
    log::debug!("DFU worker exiting");
}

/// Ordered, single-threaded executor for DFU jobs.
pub struct DfuEngine {
    sender: Option<mpsc::Sender<Box<dyn Job>>>,
    handle: Option<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    transport: SharedTransport,
    shutdown_grace: Duration,
}

impl DfuEngine {
    /// Start the worker thread.
    pub fn new<E>(settings: ProgrammerSettings, events: E) -> DfuResult<Self>
    where
        E: Fn(DfuEvent) + Send + Sync + 'static,
    {
        let (sender, jobs) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let generation = Arc::new(AtomicU64::new(0));
        let transport = SharedTransport::default();
        let shutdown_grace = Duration::from_millis(settings.shutdown_grace_ms);

        let worker = Worker {
            transport: transport.clone(),
            settings,
            image: None,
            cancel: Arc::clone(&cancel),
            generation: Arc::clone(&generation),
            events: Arc::new(events),
            boot_pins: None,
        };

        let handle = thread::Builder::new()
            .name("dfu-worker".into())
            .spawn(move || run_worker(worker, jobs))?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            cancel,
            generation,
            transport,
            shutdown_grace,
        })
    }

    fn submit<R, F>(&self, name: &'static str, work: F) -> JobReceiver<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Worker) -> DfuResult<R> + Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let job: Box<dyn Job> = Box::new(Task {
            name,
            generation: self.generation.load(Ordering::SeqCst),
            work,
            reply,
        });

        match &self.sender {
            Some(sender) => {
                if let Err(mpsc::SendError(job)) = sender.send(job) {
                    job.reject(DfuError::WorkerStopped);
                }
            }
            None => job.reject(DfuError::WorkerStopped),
        }
        receiver
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Attach a newly opened device, or detach with `None`.
    ///
    /// Takes effect immediately, even while a job is running.
    pub fn set_transport(&self, transport: Option<Box<dyn DfuTransport>>) {
        if let Some(mut previous) = self.transport.replace(transport) {
            if let Err(e) = previous.release() {
                log::debug!("Releasing previous transport: {}", e);
            }
        }
    }

    /// Check whether a device transport is attached.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    // ------------------------------------------------------------------------
    // Image
    // ------------------------------------------------------------------------

    /// Read and validate a `.dfu` file, making it the loaded image.
    pub fn load_file(&self, path: PathBuf) -> JobReceiver<FirmwareImage> {
        self.submit("Load file", move |worker| {
            worker.emit(DfuEvent::Loading {
                path: path.display().to_string(),
            });
            let image = read_dfu_file(&path)?;
            Ok(worker.load(image))
        })
    }

    /// Validate an in-memory `.dfu` image, making it the loaded image.
    pub fn load_bytes(&self, bytes: Vec<u8>) -> JobReceiver<FirmwareImage> {
        self.submit("Load image", move |worker| {
            let image = parse_dfu_image(&bytes)?;
            Ok(worker.load(image))
        })
    }

    // ------------------------------------------------------------------------
    // Device workflows
    // ------------------------------------------------------------------------

    /// Load `path` and run the full erase/write/verify/option-byte workflow.
    pub fn program_firmware(&self, path: PathBuf) -> JobReceiver<Outcome> {
        self.submit("Program firmware", move |worker| {
            worker.emit(DfuEvent::Loading {
                path: path.display().to_string(),
            });
            let image = worker.load(read_dfu_file(&path)?);

            let mut programmer = worker.programmer()?;
            let outcome = programmer.program_firmware(&image)?;
            if outcome == Outcome::Complete {
                worker.device_gone();
            }
            Ok(outcome)
        })
    }

    /// Mass erase, skipping the erase when the loaded image finds the device blank.
    pub fn mass_erase(&self) -> JobReceiver<Outcome> {
        self.submit("Mass erase", |worker| {
            let mut programmer = worker.programmer()?;
            programmer.mass_erase(worker.image.as_ref())
        })
    }

    /// Compare device flash with the loaded image.
    pub fn verify(&self) -> JobReceiver<bool> {
        self.submit("Verify", |worker| {
            let mut programmer = worker.programmer()?;
            programmer.verify(worker.image()?)
        })
    }

    /// Write the loaded image without erasing or verifying.
    pub fn program(&self) -> JobReceiver<()> {
        self.submit("Program", |worker| {
            let mut programmer = worker.programmer()?;
            programmer.program(worker.image()?)
        })
    }

    pub fn fast_operations(&self) -> JobReceiver<bool> {
        self.submit("Fast operations", |worker| worker.programmer()?.fast_operations())
    }

    /// Write the user option bytes. The device resets afterwards.
    pub fn write_option_bytes(&self, options: OptionBytes) -> JobReceiver<()> {
        self.submit("Write option bytes", move |worker| {
            worker.programmer()?.write_option_bytes(options)?;
            worker.device_gone();
            Ok(())
        })
    }

    /// Jump to the application in flash.
    pub fn leave_dfu_mode(&self) -> JobReceiver<bool> {
        self.submit("Leave DFU mode", |worker| {
            let left = worker.programmer()?.leave_dfu_mode()?;
            if left {
                worker.device_gone();
            }
            Ok(left)
        })
    }

    // ------------------------------------------------------------------------
    // Boot pins
    // ------------------------------------------------------------------------

    pub fn set_boot_pins(&self, pins: Box<dyn BootPins>) -> JobReceiver<()> {
        self.submit("Attach boot pins", move |worker| {
            worker.boot_pins = Some(pins);
            Ok(())
        })
    }

    /// Reset the target into the ROM bootloader.
    pub fn enter_dfu_mode(&self) -> JobReceiver<bool> {
        self.submit("Enter DFU mode", |worker| {
            let success = worker
                .boot_pins()?
                .enter_dfu_mode()
                .map_err(|reason| DfuError::BootControl { reason })?;
            worker.emit(DfuEvent::BootMode { dfu: true, success });
            Ok(success)
        })
    }

    /// Reset the target into its application.
    pub fn enter_normal_mode(&self) -> JobReceiver<bool> {
        self.submit("Enter normal mode", |worker| {
            let success = worker
                .boot_pins()?
                .enter_normal_mode()
                .map_err(|reason| DfuError::BootControl { reason })?;
            worker.emit(DfuEvent::BootMode { dfu: false, success });
            Ok(success)
        })
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Interrupt the running job. It and every job queued before this call
    /// complete with [`DfuError::Interrupted`]; jobs submitted afterwards run
    /// normally.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Cancel outstanding work and stop the worker.
    ///
    /// # Returns
    /// `true` if the worker exited within the grace period, `false` if it
    /// was left running detached
    pub fn shutdown(&mut self) -> bool {
        self.cancel();
        self.sender.take();

        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + self.shutdown_grace;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "DFU worker did not stop within {} ms, detaching",
                    self.shutdown_grace.as_millis()
                );
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        handle.join().is_ok()
    }
}

impl Drop for DfuEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::dfu::config::INTERNAL_FLASH_START;
    use crate::test_helpers::{DfuFileBuilder, SimulatedBootloader, TestContext};
    use crate::traits::MockBootPins;

    type Recorded = Arc<Mutex<Vec<DfuEvent>>>;

    fn engine() -> (DfuEngine, Recorded) {
        let events: Recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let engine = DfuEngine::new(ProgrammerSettings::default(), move |event| {
            sink.lock().unwrap().push(event)
        })
        .unwrap();
        (engine, events)
    }

    fn attach(engine: &DfuEngine) -> SimulatedBootloader {
        let sim = SimulatedBootloader::new();
        engine.set_transport(Some(Box::new(sim.clone())));
        sim
    }

    fn failures(events: &Recorded) -> Vec<String> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                DfuEvent::Failed { code, .. } => Some(code.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_load_file_emits_events() {
        let ctx = TestContext::new();
        let path = ctx.create_file_bytes("firmware.dfu", &DfuFileBuilder::new().build());
        let (engine, events) = engine();

        let image = engine.load_file(path).blocking_recv().unwrap().unwrap();

        assert_eq!(image.element_address, INTERNAL_FLASH_START);
        let events = events.lock().unwrap();
        assert!(matches!(events[0], DfuEvent::Loading { .. }));
        match &events[1] {
            DfuEvent::FileVerified { size, sha256, .. } => {
                assert_eq!(*size, 1024);
                assert_eq!(sha256.len(), 64);
            }
            other => panic!("expected FileVerified, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_job_reports_and_worker_stays_ready() {
        let (engine, events) = engine();

        let err = engine
            .load_bytes(vec![0u8; 10])
            .blocking_recv()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, DfuError::Format(_)));
        assert_eq!(failures(&events), vec![err.error_code().to_string()]);

        let image = engine
            .load_bytes(DfuFileBuilder::new().build())
            .blocking_recv()
            .unwrap();
        assert!(image.is_ok());
    }

    #[test]
    fn test_device_jobs_need_a_transport() {
        let (engine, _) = engine();

        let result = engine.mass_erase().blocking_recv().unwrap();
        assert!(matches!(result, Err(DfuError::NotConnected)));
    }

    #[test]
    fn test_verify_needs_an_image() {
        let (engine, _) = engine();
        let sim = attach(&engine);

        let result = engine.verify().blocking_recv().unwrap();

        assert!(matches!(result, Err(DfuError::NoImageLoaded)));
        assert_eq!(sim.transfer_count(), 0);
    }

    #[test]
    fn test_program_firmware_job() {
        let ctx = TestContext::new();
        let path = ctx.create_file_bytes("firmware.dfu", &DfuFileBuilder::new().build());
        let (engine, events) = engine();
        let sim = attach(&engine);

        let outcome = engine.program_firmware(path).blocking_recv().unwrap().unwrap();

        assert_eq!(outcome, Outcome::Complete);
        assert_eq!(sim.option_bytes(), Some(0xAAE8));
        assert!(!engine.is_connected());
        assert!(events.lock().unwrap().contains(&DfuEvent::Complete));
    }

    #[test]
    fn test_protected_device_resets_and_detaches() {
        let ctx = TestContext::new();
        let path = ctx.create_file_bytes("firmware.dfu", &DfuFileBuilder::new().build());
        let (engine, _) = engine();
        let sim = attach(&engine);
        sim.set_protected(true);

        let outcome = engine.program_firmware(path).blocking_recv().unwrap().unwrap();

        assert_eq!(outcome, Outcome::DeviceResetting);
        assert!(sim.released());
        assert!(!engine.is_connected());
    }

    #[test]
    fn test_write_then_verify_loaded_image() {
        let (engine, _) = engine();
        let sim = attach(&engine);

        let load = engine.load_bytes(DfuFileBuilder::new().build());
        let program = engine.program();
        let verify = engine.verify();

        let image = load.blocking_recv().unwrap().unwrap();
        program.blocking_recv().unwrap().unwrap();
        assert!(verify.blocking_recv().unwrap().unwrap());
        assert_eq!(
            sim.flash(INTERNAL_FLASH_START, image.payload.len()),
            image.payload
        );
    }

    #[test]
    fn test_boot_pins() {
        let (engine, events) = engine();

        let result = engine.enter_dfu_mode().blocking_recv().unwrap();
        assert!(matches!(result, Err(DfuError::BootControl { .. })));

        let mut pins = MockBootPins::new();
        pins.expect_enter_dfu_mode().times(1).returning(|| Ok(true));
        pins.expect_enter_normal_mode()
            .times(1)
            .returning(|| Err("pin driver not responding".into()));
        engine.set_boot_pins(Box::new(pins)).blocking_recv().unwrap().unwrap();

        assert!(engine.enter_dfu_mode().blocking_recv().unwrap().unwrap());
        let err = engine
            .enter_normal_mode()
            .blocking_recv()
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("pin driver not responding"));
        assert!(events
            .lock()
            .unwrap()
            .contains(&DfuEvent::BootMode { dfu: true, success: true }));
    }

    #[test]
    fn test_cancel_interrupts_queued_jobs() {
        let (engine, _) = engine();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        let mut pins = MockBootPins::new();
        pins.expect_enter_dfu_mode().times(1).returning(move || {
            started_tx.send(()).unwrap();
            gate_rx.recv().unwrap();
            Ok(true)
        });
        engine.set_boot_pins(Box::new(pins)).blocking_recv().unwrap().unwrap();

        let running = engine.enter_dfu_mode();
        let queued = engine.load_bytes(DfuFileBuilder::new().build());

        started_rx.recv().unwrap();
        engine.cancel();
        gate_tx.send(()).unwrap();

        assert!(running.blocking_recv().unwrap().unwrap());
        assert!(matches!(
            queued.blocking_recv().unwrap(),
            Err(DfuError::Interrupted)
        ));
        engine
            .load_bytes(DfuFileBuilder::new().build())
            .blocking_recv()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_engine_accepts_work_after_cancel() {
        let (engine, _) = engine();
        let sim = attach(&engine);

        engine.cancel();
        let load = engine.load_bytes(DfuFileBuilder::new().build());
        let program = engine.program();

        let image = load.blocking_recv().unwrap().unwrap();
        program.blocking_recv().unwrap().unwrap();
        assert_eq!(
            sim.flash(INTERNAL_FLASH_START, image.payload.len()),
            image.payload
        );
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let (mut engine, _) = engine();

        assert!(engine.shutdown());
        let result = engine.load_bytes(DfuFileBuilder::new().build()).blocking_recv();

        assert!(matches!(result, Ok(Err(DfuError::WorkerStopped))));
        assert!(engine.shutdown());
    }

    #[tokio::test]
    async fn test_jobs_complete_in_submission_order() {
        let (engine, events) = engine();
        let sim = attach(&engine);
        sim.fill_flash(INTERNAL_FLASH_START, &[0x00; 16]);

        let load = engine.load_bytes(DfuFileBuilder::new().build());
        let erase = engine.mass_erase();

        load.await.unwrap().unwrap();
        assert_eq!(erase.await.unwrap().unwrap(), Outcome::Complete);
        assert_eq!(sim.erase_count(), 1);

        let events = events.lock().unwrap();
        let verified = events
            .iter()
            .position(|e| matches!(e, DfuEvent::FileVerified { .. }));
        let erased = events
            .iter()
            .position(|e| matches!(e, DfuEvent::EraseComplete { .. }));
        assert!(verified < erased);
    }
}
