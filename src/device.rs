//! Value cache and polling scheduler for the heat pump's registers.
//!
//! One scheduler task keeps the cache fresh by multiplexing three traffic
//! classes onto the single transport without starving any of them. Per
//! tick (1 s by default, ticks never overlap):
//!
//! 1. always: the LOG.SET block, read as grouped block reads, followed by
//!    a bulk change notification;
//! 2. else-if a degree-minutes setpoint write is pending, on alternating
//!    ticks: that write;
//! 3. else-if the ad-hoc FIFO is non-empty: exactly one entry;
//! 4. else: one slow-set register, round-robin.
//!
//! The controller and external callers interact through the cloneable
//! [`Nibe1155`] handle; the scheduler owns the wire.

use crate::error::{Error, Result};
use crate::frame::AsciiFrame;
use crate::registers::{Catalog, Register, DEGREE_MINUTES, LOG_SET_IDS, REGISTERS, SLOW_IDS};
use crate::request::{ModbusRequest, FC_READ_HOLDING_REGISTERS, FC_WRITE_HOLDING_REGISTER};
use crate::transport::{ModbusSerial, TimeoutClass};
use crate::value::{decode_raw, encode_scaled, RegisterValue};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Modbus unit id of the MODBUS 40 gateway.
pub const UNIT_ID: u8 = 1;

/// Default scheduler tick period.
pub const POLL_PERIOD: Duration = Duration::from_secs(1);

/// Capacity of the change notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Emitted whenever a register's decoded value changes.
#[derive(Debug, Clone, Copy)]
pub struct ValueChange {
    pub id: u16,
    pub raw: i64,
    pub scaled: f64,
}

/// Read-only view of one cached value, for monitoring consumers.
#[derive(Debug, Clone, Copy)]
pub struct CachedValue {
    pub register: &'static Register,
    pub raw: Option<i64>,
    pub scaled: f64,
    /// Time since the last successful read; `None` while unknown.
    pub age: Option<Duration>,
}

#[derive(Debug)]
enum Op {
    Read,
    Write(u16),
}

/// One externally requested read or write, resolved exactly once.
struct PendingRequest {
    id: u16,
    op: Op,
    done: oneshot::Sender<Result<f64>>,
}

struct Shared {
    catalog: Catalog,
    values: Mutex<HashMap<u16, RegisterValue>>,
    /// Degree-minutes value the controller wants written, serviced by the
    /// scheduler on alternating ticks.
    dm_pending: Mutex<Option<f64>>,
    changes: broadcast::Sender<ValueChange>,
}

/// Cloneable handle to the cache and the ad-hoc request queue.
#[derive(Clone)]
pub struct Nibe1155 {
    shared: Arc<Shared>,
    adhoc: mpsc::UnboundedSender<PendingRequest>,
}

impl Nibe1155 {
    /// Builds the cache and its scheduler without starting it. The caller
    /// decides where the scheduler runs (tests drive it tick by tick).
    pub fn new(serial: ModbusSerial, catalog: Catalog) -> (Self, Scheduler) {
        let mut values = HashMap::with_capacity(REGISTERS.len());
        for reg in REGISTERS {
            values.insert(reg.id, RegisterValue::new(reg));
        }
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            catalog,
            values: Mutex::new(values),
            dm_pending: Mutex::new(None),
            changes,
        });
        let (adhoc_tx, adhoc_rx) = mpsc::unbounded_channel();
        let handle = Self {
            shared: shared.clone(),
            adhoc: adhoc_tx,
        };
        let log_groups = shared.catalog.log_set_groups();
        let scheduler = Scheduler {
            serial,
            shared,
            adhoc: adhoc_rx,
            log_groups,
            slow_index: 0,
            dm_tick: false,
        };
        (handle, scheduler)
    }

    /// Builds the cache and spawns the scheduler with the given period.
    pub fn start(serial: ModbusSerial, catalog: Catalog, period: Duration) -> Self {
        let (handle, scheduler) = Self::new(serial, catalog);
        tokio::spawn(scheduler.run(period));
        handle
    }

    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    /// Subscribes to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ValueChange> {
        self.shared.changes.subscribe()
    }

    /// Cached view of one register.
    pub fn value(&self, id: u16) -> Option<CachedValue> {
        let values = self.shared.values.lock().expect("value cache poisoned");
        values.get(&id).map(cached_view)
    }

    /// Cached view of every register, in catalog order.
    pub fn snapshot(&self) -> Vec<CachedValue> {
        let values = self.shared.values.lock().expect("value cache poisoned");
        REGISTERS
            .iter()
            .filter_map(|reg| values.get(&reg.id).map(cached_view))
            .collect()
    }

    /// Returns the cached value if it is younger than `max_age` (or
    /// unconditionally when `max_age` is `None`), otherwise reads the
    /// register through the ad-hoc queue. `Some(Duration::ZERO)` always
    /// forces a wire read. A value that has never been read is never
    /// returned from the cache.
    pub async fn get_register_value(&self, id: u16, max_age: Option<Duration>) -> Result<f64> {
        {
            let values = self.shared.values.lock().expect("value cache poisoned");
            let value = values.get(&id).ok_or(Error::UnknownRegister(id))?;
            if let Some(at) = value.value_at() {
                let fresh = match max_age {
                    None => true,
                    Some(limit) => at.elapsed() <= limit,
                };
                if fresh {
                    return Ok(value.scaled());
                }
            }
        }
        self.read_register(id).await
    }

    /// Reads one register through the ad-hoc queue, refreshing the cache.
    pub async fn read_register(&self, id: u16) -> Result<f64> {
        self.shared
            .catalog
            .by_id(id)
            .ok_or(Error::UnknownRegister(id))?;
        self.enqueue(id, Op::Read).await
    }

    /// Writes a scaled value to one register through the ad-hoc queue.
    /// The value is validated against the descriptor before anything is
    /// queued.
    pub async fn write_register(&self, id: u16, scaled: f64) -> Result<()> {
        let reg = self
            .shared
            .catalog
            .by_id(id)
            .ok_or(Error::UnknownRegister(id))?;
        let raw = encode_scaled(reg, scaled)?;
        self.enqueue(id, Op::Write(raw)).await.map(|_| ())
    }

    /// Hands the scheduler a degree-minutes setpoint to write on one of
    /// the next alternating ticks. Replaces any not-yet-written value.
    pub fn set_pending_degree_minutes(&self, dm: f64) {
        *self
            .shared
            .dm_pending
            .lock()
            .expect("dm pending poisoned") = Some(dm);
    }

    pub fn pending_degree_minutes(&self) -> Option<f64> {
        *self.shared.dm_pending.lock().expect("dm pending poisoned")
    }

    async fn enqueue(&self, id: u16, op: Op) -> Result<f64> {
        let (done, rx) = oneshot::channel();
        self.adhoc
            .send(PendingRequest { id, op, done })
            .map_err(|_| Error::TransportClosed)?;
        rx.await.map_err(|_| Error::TransportClosed)?
    }
}

fn cached_view(value: &RegisterValue) -> CachedValue {
    CachedValue {
        register: value.register(),
        raw: value.raw(),
        scaled: value.scaled(),
        age: value.value_at().map(|at| at.elapsed()),
    }
}

/// Owns the transport and drives the per-tick polling algorithm.
pub struct Scheduler {
    serial: ModbusSerial,
    shared: Arc<Shared>,
    adhoc: mpsc::UnboundedReceiver<PendingRequest>,
    log_groups: Vec<(u16, u16)>,
    slow_index: usize,
    dm_tick: bool,
}

impl Scheduler {
    /// Runs the tick loop forever. A tick that is still in progress when
    /// the next period elapses makes the timer skip, never overlap.
    pub async fn run(mut self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One scheduler tick: step 1 always, then exactly one of steps 2-4.
    pub async fn tick(&mut self) {
        self.poll_log_set().await;
        self.emit_changes();

        self.dm_tick = !self.dm_tick;
        if self.dm_tick {
            let pending = self
                .shared
                .dm_pending
                .lock()
                .expect("dm pending poisoned")
                .take();
            if let Some(dm) = pending {
                if let Err(err) = self.write_scaled(DEGREE_MINUTES, dm).await {
                    warn!("pending degree-minutes write ({dm}) failed: {err}");
                    let mut slot = self
                        .shared
                        .dm_pending
                        .lock()
                        .expect("dm pending poisoned");
                    // retry on a later tick unless the controller moved on
                    if slot.is_none() {
                        *slot = Some(dm);
                    }
                }
                return;
            }
        }

        if let Ok(request) = self.adhoc.try_recv() {
            self.service(request).await;
            return;
        }

        self.poll_slow_one().await;
    }

    async fn poll_log_set(&mut self) {
        for (first, quantity) in self.log_groups.clone() {
            if let Err(err) = self.read_group(first, quantity, TimeoutClass::Fast).await {
                warn!("polling {quantity} registers starting at {first} failed: {err}");
            }
        }
    }

    async fn read_group(&mut self, first: u16, quantity: u16, class: TimeoutClass) -> Result<()> {
        // register ids are already the wire addresses; the builder
        // subtracts one from its 1-based argument
        let request = ModbusRequest::read_holding_registers(UNIT_ID, first + 1, quantity)?;
        let response = self.serial.send(&request, class).await?;
        check_function_code(&response, FC_READ_HOLDING_REGISTERS)?;
        let now = Instant::now();
        let mut values = self.shared.values.lock().expect("value cache poisoned");
        let mut offset = 3;
        for id in first..first + quantity {
            let Some(value) = values.get_mut(&id) else {
                warn!("skip response id {id}, not in catalog");
                offset += 2;
                continue;
            };
            let words = value.register().size.words();
            let wire = if words == 2 {
                response.u32_at(offset)
            } else {
                response.u16_at(offset)
            };
            let Some(wire) = wire else {
                return Err(Error::Response(format!(
                    "short read response for registers {first}+{quantity}"
                )));
            };
            value.set_raw(wire, now);
            offset += 2 * words as usize;
        }
        Ok(())
    }

    /// Reads one register (one or two words) and refreshes its cache
    /// entry, returning the scaled value.
    async fn read_single(&mut self, id: u16) -> Result<f64> {
        let reg = self
            .shared
            .catalog
            .by_id(id)
            .ok_or(Error::UnknownRegister(id))?;
        let request = ModbusRequest::read_holding_registers(UNIT_ID, id + 1, reg.size.words())?;
        let response = self.serial.send(&request, TimeoutClass::Normal).await?;
        check_function_code(&response, FC_READ_HOLDING_REGISTERS)?;
        let wire = if reg.size.words() == 2 {
            response.u32_at(3)
        } else {
            response.u16_at(3)
        };
        let wire = wire.ok_or_else(|| {
            Error::Response(format!("short read response for register {id}"))
        })?;
        let now = Instant::now();
        let scaled = {
            let mut values = self.shared.values.lock().expect("value cache poisoned");
            let value = values
                .get_mut(&id)
                .ok_or(Error::UnknownRegister(id))?;
            value.set_raw(wire, now);
            value.scaled()
        };
        self.emit_changes();
        Ok(scaled)
    }

    async fn write_raw(&mut self, id: u16, raw: u16) -> Result<()> {
        let request = ModbusRequest::write_holding_register(UNIT_ID, id + 1, raw)?;
        let response = self.serial.send(&request, TimeoutClass::Normal).await?;
        check_function_code(&response, FC_WRITE_HOLDING_REGISTER)?;
        Ok(())
    }

    async fn write_scaled(&mut self, id: u16, scaled: f64) -> Result<()> {
        let reg = self
            .shared
            .catalog
            .by_id(id)
            .ok_or(Error::UnknownRegister(id))?;
        let raw = encode_scaled(reg, scaled)?;
        self.write_raw(id, raw).await
    }

    async fn service(&mut self, request: PendingRequest) {
        let result = match request.op {
            Op::Read => self.read_single(request.id).await,
            Op::Write(raw) => {
                let scaled = self
                    .shared
                    .catalog
                    .by_id(request.id)
                    .map(|reg| decode_raw(reg.size, raw as i64) as f64 * reg.scale)
                    .unwrap_or(f64::NAN);
                self.write_raw(request.id, raw).await.map(|()| scaled)
            }
        };
        if request.done.send(result).is_err() {
            debug!("ad-hoc requester for register {} gave up", request.id);
        }
    }

    async fn poll_slow_one(&mut self) {
        if SLOW_IDS.is_empty() {
            return;
        }
        let id = SLOW_IDS[self.slow_index % SLOW_IDS.len()];
        self.slow_index = (self.slow_index + 1) % SLOW_IDS.len();
        if let Err(err) = self.read_single(id).await {
            warn!("slow poll of register {id} failed: {err}");
        }
    }

    /// Current round-robin position in the slow set.
    pub fn slow_index(&self) -> usize {
        self.slow_index
    }

    fn emit_changes(&self) {
        let mut values = self.shared.values.lock().expect("value cache poisoned");
        for id in LOG_SET_IDS.iter().chain(SLOW_IDS.iter()) {
            if let Some(value) = values.get_mut(id) {
                if value.take_changed() {
                    let change = ValueChange {
                        id: *id,
                        raw: value.raw().unwrap_or_default(),
                        scaled: value.scaled(),
                    };
                    // nobody listening is fine
                    let _ = self.shared.changes.send(change);
                }
            }
        }
    }
}

/// One-shot register read over an otherwise idle link (CLI usage).
/// Returns the sign-extended raw value and the scaled value.
pub async fn read_once(serial: &ModbusSerial, reg: &Register) -> Result<(i64, f64)> {
    let request = ModbusRequest::read_holding_registers(UNIT_ID, reg.id + 1, reg.size.words())?;
    let response = serial.send(&request, TimeoutClass::Normal).await?;
    check_function_code(&response, FC_READ_HOLDING_REGISTERS)?;
    let wire = if reg.size.words() == 2 {
        response.u32_at(3)
    } else {
        response.u16_at(3)
    };
    let wire = wire.ok_or_else(|| {
        Error::Response(format!("short read response for register {}", reg.id))
    })?;
    let raw = decode_raw(reg.size, wire);
    Ok((raw, raw as f64 * reg.scale))
}

/// One-shot register write over an otherwise idle link (CLI usage).
pub async fn write_once(serial: &ModbusSerial, reg: &Register, scaled: f64) -> Result<()> {
    let raw = encode_scaled(reg, scaled)?;
    let request = ModbusRequest::write_holding_register(UNIT_ID, reg.id + 1, raw)?;
    let response = serial.send(&request, TimeoutClass::Normal).await?;
    check_function_code(&response, FC_WRITE_HOLDING_REGISTER)?;
    Ok(())
}

fn check_function_code(response: &AsciiFrame, expected: u8) -> Result<()> {
    match response.payload().get(1) {
        Some(fc) if *fc == expected => Ok(()),
        Some(fc) if *fc == expected | 0x80 => Err(Error::Response(format!(
            "modbus exception 0x{:02X}",
            response.payload().get(2).copied().unwrap_or(0)
        ))),
        other => Err(Error::Response(format!(
            "unexpected function code {other:?}"
        ))),
    }
}
