//! Heat pump control state machine.
//!
//! A finite-state loop on the scheduler's cadence that reads cached plant
//! values and issues register writes to steer the compressor toward the
//! operator's target: a fixed frequency or a supply-temperature band. The
//! device's own degree-minutes integrator does the actual compressor
//! demand; this loop nudges it, manages the forbidden resonance-frequency
//! bands and sequences switch-on/off within hard safety limits.

use crate::device::Nibe1155;
use crate::dmlog::{DmLog, DmLogEntry};
use crate::error::{Error, Result};
use crate::registers::{
    pump_mode, ADD_HEATER_POWER, BRINE_PUMP_MODE, BRINE_PUMP_SPEED, COMPRESSOR_FREQUENCY,
    CONDENSER_OUT_TEMP, CUT_OFF_ACTIVATED_1, CUT_OFF_ACTIVATED_2, CUT_OFF_START_1,
    CUT_OFF_START_2, CUT_OFF_STOP_1, CUT_OFF_STOP_2, DEGREE_MINUTES, HEAT_TEMP_MAX,
    HEAT_TEMP_MIN, MAX_ADD_POWER, SUPPLY_PUMP_MODE, SUPPLY_PUMP_SPEED, SUPPLY_RETURN_TEMP,
    SUPPLY_TEMP,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Compressor frequency floor the device accepts.
pub const F_MIN: f64 = 26.0;
/// Nominal compressor frequency ceiling.
pub const F_MAX: f64 = 90.0;
/// Reduced ceiling once the condenser runs hot.
pub const F_MAX_HOT_CONDENSER: f64 = 40.0;
/// Condenser-out temperature above which the ceiling drops.
pub const T_CONDENSER_REDUCE: f64 = 55.0;
/// Condenser-out temperature that forces an immediate switch-off.
pub const T_CONDENSER_MAX: f64 = 62.0;
/// Degree-minutes never go below this.
pub const DM_FLOOR: f64 = -1200.0;
/// Degree-minutes preset when additive heating is permitted.
const DM_PRESET_ADDITIVE: f64 = -450.0;
/// Degree-minutes preset at minimum-frequency setpoints without additive heating.
const DM_PRESET_MIN: f64 = -50.0;
/// Degree-minutes written to start the compressor.
const SWITCH_ON_DM: f64 = -100.0;
/// Small positive degree-minutes value that removes all heat demand.
const SWITCH_OFF_DM: f64 = 1.0;
/// Placeholder supply temperature limit while switched off.
const IDLE_TEMP: f64 = 20.0;
/// Supply temperature drift that triggers a min/max limit rewrite.
const TEMP_SHADOW_BAND: f64 = 0.2;
/// Offset above the live supply temperature written to the limits.
const TEMP_WRITE_OFFSET: f64 = 0.1;

/// First resonance band (start, stop) in Hz.
const CUT_OFF_BAND_1: (f64, f64) = (47.0, 58.0);
/// Second resonance band (start, stop) in Hz.
const CUT_OFF_BAND_2: (f64, f64) = (90.0, 118.0);
/// Safety margin added to the target frequency before band placement.
const CUT_OFF_PADDING: f64 = 5.0;
/// Minimum width of an active band.
const CUT_OFF_MIN_WIDTH: f64 = 5.0;

/// Operator intent: what the controller should drive the plant toward.
/// Replaced wholesale, never patched field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum HeatPumpConfig {
    Off,
    Frequency { f_setpoint: f64, p_add_heater: f64 },
    Temperature { f_setpoint: f64, t_min: f64, t_max: f64 },
    Test,
}

impl HeatPumpConfig {
    /// Validates numeric ranges. A rejected config never reaches the
    /// running controller.
    pub fn validate(&self) -> Result<()> {
        fn check(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
            if (min..=max).contains(&value) {
                Ok(())
            } else {
                Err(Error::Config(format!(
                    "{name} = {value} outside [{min}, {max}]"
                )))
            }
        }
        match self {
            Self::Off | Self::Test => Ok(()),
            Self::Frequency {
                f_setpoint,
                p_add_heater,
            } => {
                check("f_setpoint", *f_setpoint, 20.0, 100.0)?;
                check("p_add_heater", *p_add_heater, 0.0, 6500.0)
            }
            Self::Temperature {
                f_setpoint,
                t_min,
                t_max,
            } => {
                check("f_setpoint", *f_setpoint, 20.0, 100.0)?;
                check("t_min", *t_min, 20.0, 60.0)?;
                check("t_max", *t_max, 20.0, 60.0)?;
                if t_min > t_max {
                    return Err(Error::Config(format!("t_min {t_min} above t_max {t_max}")));
                }
                Ok(())
            }
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            Self::Off => Mode::Off,
            Self::Frequency { .. } => Mode::Frequency,
            Self::Temperature { .. } => Mode::Temperature,
            Self::Test => Mode::Test,
        }
    }

    fn f_setpoint(&self) -> f64 {
        match self {
            Self::Frequency { f_setpoint, .. } | Self::Temperature { f_setpoint, .. } => {
                *f_setpoint
            }
            Self::Off | Self::Test => 0.0,
        }
    }

    fn p_add_heater(&self) -> f64 {
        match self {
            Self::Frequency { p_add_heater, .. } => *p_add_heater,
            _ => 0.0,
        }
    }
}

/// The four operator-selectable modes, used as expected-state tokens by
/// bounded wait loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Off,
    Frequency,
    Temperature,
    Test,
}

impl Mode {
    pub fn name(self) -> &'static str {
        match self {
            Mode::Off => "off",
            Mode::Frequency => "frequency",
            Mode::Temperature => "temperature",
            Mode::Test => "test",
        }
    }
}

/// Controller state, advanced once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Init,
    Off,
    Frequency,
    Temperature,
    Test,
    Error,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            State::Init => "init",
            State::Off => "off",
            State::Frequency => "frequency",
            State::Temperature => "temperature",
            State::Test => "test",
            State::Error => "error",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn state_for(mode: Mode) -> State {
    match mode {
        Mode::Off => State::Off,
        Mode::Frequency => State::Frequency,
        Mode::Temperature => State::Temperature,
        Mode::Test => State::Test,
    }
}

/// Pure snapshot of the controller and the plant, published every tick.
/// Consumed (never mutated) by API and broadcast layers.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub config: HeatPumpConfig,
    pub state: State,
    pub f_compressor: f64,
    pub p_add_heater: f64,
    pub t_supply: f64,
    pub t_supply_return: f64,
    pub t_condenser_out: f64,
    pub speed_brine_pump: f64,
    pub speed_supply_pump: f64,
}

/// Controller cadence and bounds. Defaults match the device; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Control tick period.
    pub tick: Duration,
    /// Poll step inside bounded switch-on/off waits.
    pub wait_step: Duration,
    /// Bound for switch-on/off sequences started from state handlers.
    pub switch_bound: Duration,
    /// Minimum interval between degree-minutes adjustments.
    pub dm_interval: Duration,
    /// Freshness bound for cached plant values.
    pub max_value_age: Duration,
    /// Attempts in a write/verify loop before giving up.
    pub write_retries: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            wait_step: Duration::from_secs(1),
            switch_bound: Duration::from_secs(60),
            dm_interval: Duration::from_secs(10),
            max_value_age: Duration::from_secs(5),
            write_retries: 5,
        }
    }
}

/// Degree-minutes working value with its rate-limit bookkeeping.
#[derive(Debug)]
struct DmSetpoint {
    value: f64,
    written_at: Option<Instant>,
    refreshed_at: Option<Instant>,
}

impl DmSetpoint {
    fn new(value: f64) -> Self {
        Self {
            value,
            written_at: None,
            refreshed_at: None,
        }
    }
}

/// External surface of a running controller.
#[derive(Clone)]
pub struct HeatPumpHandle {
    config_tx: watch::Sender<HeatPumpConfig>,
    snapshot_rx: watch::Receiver<Snapshot>,
}

impl HeatPumpHandle {
    /// Validates and atomically replaces the controller config. A
    /// rejected config leaves the previous one untouched.
    pub fn set_config(&self, config: HeatPumpConfig) -> Result<()> {
        config.validate()?;
        self.config_tx
            .send(config)
            .map_err(|_| Error::ControllerStopped)
    }

    pub fn config(&self) -> HeatPumpConfig {
        self.config_tx.borrow().clone()
    }

    /// Latest published controller snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver that wakes on every published snapshot.
    pub fn watch_snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_rx.clone()
    }
}

/// The control loop itself. Owned by its task; everything external goes
/// through [`HeatPumpHandle`].
pub struct HeatPump {
    dev: Nibe1155,
    timing: Timing,
    dmlog: DmLog,
    config: HeatPumpConfig,
    config_rx: watch::Receiver<HeatPumpConfig>,
    snapshot_tx: watch::Sender<Snapshot>,
    state: State,
    recent_state: State,
    dm: DmSetpoint,
    reg_temp_min: Option<f64>,
    reg_temp_max: Option<f64>,
}

impl HeatPump {
    pub fn new(
        dev: Nibe1155,
        config: HeatPumpConfig,
        dmlog: DmLog,
        timing: Timing,
    ) -> Result<(Self, HeatPumpHandle)> {
        config.validate()?;
        let (config_tx, config_rx) = watch::channel(config.clone());
        let initial = Snapshot {
            config: config.clone(),
            state: State::Init,
            f_compressor: f64::NAN,
            p_add_heater: f64::NAN,
            t_supply: f64::NAN,
            t_supply_return: f64::NAN,
            t_condenser_out: f64::NAN,
            speed_brine_pump: f64::NAN,
            speed_supply_pump: f64::NAN,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let controller = Self {
            dev,
            timing,
            dmlog,
            config,
            config_rx,
            snapshot_tx,
            state: State::Init,
            recent_state: State::Init,
            dm: DmSetpoint::new(0.0),
            reg_temp_min: None,
            reg_temp_max: None,
        };
        let handle = HeatPumpHandle {
            config_tx,
            snapshot_rx,
        };
        Ok((controller, handle))
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs the control loop until the task is dropped. A tick still in
    /// progress makes the timer skip, never overlap.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.timing.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One control tick: adopt a replaced config, dispatch to the current
    /// state's handler, apply the state it requests. A handler error is
    /// logged and leaves the state unchanged, except a dead transport,
    /// which degrades to [`State::Error`].
    pub(crate) async fn tick(&mut self) {
        if self.config_rx.has_changed().unwrap_or(false) {
            let new = self.config_rx.borrow_and_update().clone();
            if new != self.config {
                info!("controller config replaced: {new:?}");
                self.config = new;
                self.state = State::Init;
            }
        }
        let state = self.state;
        let next = match state {
            State::Init => self.handle_init().await,
            State::Off => self.handle_off().await,
            State::Frequency => self.handle_frequency().await,
            State::Temperature => self.handle_temperature().await,
            State::Test => Ok(State::Test),
            State::Error => Ok(State::Off),
        };
        self.recent_state = state;
        match next {
            Ok(next) => {
                if next != state {
                    info!("controller state {state} -> {next}");
                }
                self.state = next;
            }
            Err(Error::TransportClosed) => {
                warn!("transport gone, controller entering error state");
                self.state = State::Error;
            }
            Err(err) => warn!("controller tick in state {state} failed: {err}"),
        }
        self.publish_snapshot();
    }

    // ----- state handlers ---------------------------------------------

    async fn handle_init(&mut self) -> Result<State> {
        match self.init_sequence().await {
            Ok(state) => Ok(state),
            Err(err) => {
                warn!("init failed, switching off: {err}");
                Ok(State::Off)
            }
        }
    }

    async fn init_sequence(&mut self) -> Result<State> {
        self.reg_temp_min = None;
        self.reg_temp_max = None;
        let f_setpoint = self.config.f_setpoint();
        let p_add = self.config.p_add_heater();
        self.dm = DmSetpoint::new(initial_degree_minutes(f_setpoint));
        if self.dm.value < 0.0 {
            let dm = self.dm.value;
            self.write_degree_minutes(dm).await?;
        }
        // the device's own logic can race these writes, hence verify
        self.write_verified(MAX_ADD_POWER, watts_to_kilowatts(p_add), None)
            .await?;
        self.apply_cut_off_bands(f_setpoint, None).await?;
        Ok(state_for(self.config.mode()))
    }

    async fn handle_off(&mut self) -> Result<State> {
        if self.recent_state != State::Off {
            info!("controller switching the plant off");
        }
        let expected = Some(self.config.mode());
        if let Err(err) = self.switch_off(self.timing.switch_bound, expected).await {
            warn!("switch-off sequence failed: {err}");
        }
        Ok(state_for(self.config.mode()))
    }

    async fn handle_frequency(&mut self) -> Result<State> {
        let HeatPumpConfig::Frequency {
            f_setpoint,
            p_add_heater,
        } = self.config
        else {
            return Ok(state_for(self.config.mode()));
        };
        let expected = Some(Mode::Frequency);
        self.refresh_temp_limits().await?;
        self.write_verified(MAX_ADD_POWER, watts_to_kilowatts(p_add_heater), expected)
            .await?;
        let t_condenser = self.plant_value(CONDENSER_OUT_TEMP).await?;
        let f_target = f_setpoint.min(f_max_for_condenser(t_condenser));
        self.apply_cut_off_bands(f_target, expected).await?;
        let f_compressor = self.plant_value(COMPRESSOR_FREQUENCY).await?;
        if f_compressor == 0.0 {
            self.switch_on(self.timing.switch_bound, expected).await?;
        } else {
            self.update_degree_minutes(f_target, f_setpoint, p_add_heater, expected)
                .await?;
        }
        Ok(State::Frequency)
    }

    async fn handle_temperature(&mut self) -> Result<State> {
        let HeatPumpConfig::Temperature {
            f_setpoint,
            t_min,
            t_max,
        } = self.config
        else {
            return Ok(state_for(self.config.mode()));
        };
        let expected = Some(Mode::Temperature);
        self.refresh_temp_limits().await?;
        let f_compressor = self.plant_value(COMPRESSOR_FREQUENCY).await?;
        let t_supply = self.plant_value(SUPPLY_TEMP).await?;
        if f_compressor > 0.0 && t_supply > t_max {
            self.switch_off(self.timing.switch_bound, expected).await?;
        } else if f_compressor == 0.0 && t_supply < t_min {
            self.switch_on(self.timing.switch_bound, expected).await?;
        } else {
            let t_condenser = self.plant_value(CONDENSER_OUT_TEMP).await?;
            let f_target = f_setpoint.min(f_max_for_condenser(t_condenser));
            self.update_degree_minutes(f_target, f_setpoint, 0.0, expected)
                .await?;
        }
        Ok(State::Temperature)
    }

    // ----- sequences ---------------------------------------------------

    /// Drives the plant to a full stop: no heat demand, pumps idle. With a
    /// non-zero `bound`, polls until compressor and both pumps read zero.
    async fn switch_off(&mut self, bound: Duration, expected: Option<Mode>) -> Result<()> {
        let f_compressor = self.plant_value(COMPRESSOR_FREQUENCY).await?;
        let dm = self.plant_value(DEGREE_MINUTES).await?;
        let supply_speed = self.plant_value(SUPPLY_PUMP_SPEED).await?;
        let brine_speed = self.plant_value(BRINE_PUMP_SPEED).await?;
        if f_compressor > 0.0 || dm <= 0.0 {
            self.dev.write_register(MAX_ADD_POWER, 0.0).await?;
            self.write_degree_minutes(SWITCH_OFF_DM).await?;
            self.dev.write_register(HEAT_TEMP_MIN, IDLE_TEMP).await?;
            self.reg_temp_min = Some(IDLE_TEMP);
            self.dev.write_register(HEAT_TEMP_MAX, IDLE_TEMP).await?;
            self.reg_temp_max = Some(IDLE_TEMP);
            self.dev
                .write_register(BRINE_PUMP_MODE, pump_mode::AUTO)
                .await?;
            self.dev
                .write_register(SUPPLY_PUMP_MODE, pump_mode::ECONOMY)
                .await?;
        } else if brine_speed > 0.0 {
            self.dev
                .write_register(BRINE_PUMP_MODE, pump_mode::AUTO)
                .await?;
        } else if supply_speed > 0.0 {
            self.dev
                .write_register(SUPPLY_PUMP_MODE, pump_mode::ECONOMY)
                .await?;
        }
        if bound.is_zero() {
            return Ok(());
        }
        let deadline = Instant::now() + bound;
        loop {
            tokio::time::sleep(self.timing.wait_step).await;
            self.check_mode(expected)?;
            let f = self.plant_value(COMPRESSOR_FREQUENCY).await?;
            let supply = self.plant_value(SUPPLY_PUMP_SPEED).await?;
            let brine = self.plant_value(BRINE_PUMP_SPEED).await?;
            if f == 0.0 && supply == 0.0 && brine == 0.0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(bound));
            }
        }
    }

    /// Starts the compressor by forcing heat demand. With `bound` zero a
    /// single non-blocking check is performed and its verdict returned.
    async fn switch_on(&mut self, bound: Duration, expected: Option<Mode>) -> Result<bool> {
        let f_compressor = self.plant_value(COMPRESSOR_FREQUENCY).await?;
        let dm = self.plant_value(DEGREE_MINUTES).await?;
        if !(f_compressor == 0.0 || dm >= 0.0) {
            return Ok(true);
        }
        if bound.is_zero() {
            self.refresh_temp_limits().await?;
            self.write_degree_minutes(SWITCH_ON_DM).await?;
            return self.plant_running().await;
        }
        let deadline = Instant::now() + bound;
        loop {
            self.check_mode(expected)?;
            self.refresh_temp_limits().await?;
            self.write_degree_minutes(SWITCH_ON_DM).await?;
            tokio::time::sleep(self.timing.wait_step).await;
            if self.plant_running().await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(bound));
            }
        }
    }

    async fn plant_running(&mut self) -> Result<bool> {
        let f = self.plant_value(COMPRESSOR_FREQUENCY).await?;
        let supply = self.plant_value(SUPPLY_PUMP_SPEED).await?;
        let brine = self.plant_value(BRINE_PUMP_SPEED).await?;
        Ok(f > 0.0 && supply > 0.0 && brine > 0.0)
    }

    /// Rewrites the device's supply temperature min/max only when the live
    /// supply temperature drifted out of the band around the last written
    /// value, to keep redundant traffic off the wire.
    async fn refresh_temp_limits(&mut self) -> Result<()> {
        let t_supply = self.plant_value(SUPPLY_TEMP).await?;
        let target = t_supply + TEMP_WRITE_OFFSET;
        let min_stale = self
            .reg_temp_min
            .is_none_or(|shadow| (t_supply - shadow).abs() > TEMP_SHADOW_BAND);
        if min_stale {
            self.dev.write_register(HEAT_TEMP_MIN, target).await?;
            self.reg_temp_min = Some(target);
        }
        let max_stale = self
            .reg_temp_max
            .is_none_or(|shadow| (t_supply - shadow).abs() > TEMP_SHADOW_BAND);
        if max_stale {
            self.dev.write_register(HEAT_TEMP_MAX, target).await?;
            self.reg_temp_max = Some(target);
        }
        Ok(())
    }

    /// Activates the forbidden-frequency bands appropriate for `f_target`
    /// through write/verify loops.
    async fn apply_cut_off_bands(&mut self, f_target: f64, expected: Option<Mode>) -> Result<()> {
        let plan = cut_off_plan(f_target);
        self.write_verified(CUT_OFF_START_1, plan.band1.0, expected)
            .await?;
        self.write_verified(CUT_OFF_STOP_1, plan.band1.1, expected)
            .await?;
        self.write_verified(CUT_OFF_ACTIVATED_1, 1.0, expected)
            .await?;
        match plan.band2 {
            Some((start, stop)) => {
                self.write_verified(CUT_OFF_START_2, start, expected).await?;
                self.write_verified(CUT_OFF_STOP_2, stop, expected).await?;
                self.write_verified(CUT_OFF_ACTIVATED_2, 1.0, expected)
                    .await?;
            }
            None => {
                self.write_verified(CUT_OFF_ACTIVATED_2, 0.0, expected)
                    .await?;
            }
        }
        Ok(())
    }

    /// One evaluation of the degree-minutes loop. Returns the working
    /// accumulator value; on a safety stop the prior value is returned
    /// unchanged.
    async fn update_degree_minutes(
        &mut self,
        f_target: f64,
        f_setpoint: f64,
        p_add_heater: f64,
        expected: Option<Mode>,
    ) -> Result<f64> {
        let prior = self.dm.value;
        let t_condenser = self.plant_value(CONDENSER_OUT_TEMP).await?;
        if t_condenser > T_CONDENSER_MAX {
            warn!("condenser-out {t_condenser}°C above limit, forcing switch-off");
            self.switch_off(Duration::ZERO, expected).await?;
            return Ok(prior);
        }
        if f_setpoint <= 0.0 {
            self.switch_off(Duration::ZERO, expected).await?;
            return Ok(prior);
        }
        let f_target = f_target.clamp(F_MIN, f_max_for_condenser(t_condenser));
        let now = Instant::now();
        if let Some(at) = self.dm.refreshed_at {
            if now.duration_since(at) < self.timing.dm_interval {
                return Ok(prior);
            }
        }
        self.dm.refreshed_at = Some(now);
        let f_compressor = self.plant_value(COMPRESSOR_FREQUENCY).await?;
        let diff = f_compressor - f_target;
        let mut next = prior + dm_step(diff);
        if (f_setpoint - F_MIN).abs() <= 3.0 {
            next = if p_add_heater > 0.0 {
                DM_PRESET_ADDITIVE
            } else {
                DM_PRESET_MIN
            };
        }
        if p_add_heater > 0.0 && next >= DM_PRESET_ADDITIVE {
            next = DM_PRESET_ADDITIVE;
        }
        if next >= 0.0 {
            next = -10.0;
        }
        if next < DM_FLOOR {
            next = DM_FLOOR;
        }
        let device_dm = self.plant_value(DEGREE_MINUTES).await?;
        let write = (next - device_dm).abs() >= 0.05;
        if write {
            self.dev.set_pending_degree_minutes(next);
            self.dm.written_at = Some(now);
        }
        self.dm.value = next;
        self.dmlog.append(&DmLogEntry {
            state: self.state.name(),
            f_target,
            f_compressor,
            t_condenser_out: t_condenser,
            previous: prior,
            computed: next,
            written: write,
        });
        Ok(next)
    }

    // ----- plumbing ----------------------------------------------------

    /// A plant value no older than the configured freshness bound; falls
    /// back to a wire read when the cache is stale or unknown.
    async fn plant_value(&self, id: u16) -> Result<f64> {
        self.dev
            .get_register_value(id, Some(self.timing.max_value_age))
            .await
    }

    async fn write_degree_minutes(&mut self, dm: f64) -> Result<()> {
        self.dev.write_register(DEGREE_MINUTES, dm).await?;
        self.dm.value = dm;
        self.dm.written_at = Some(Instant::now());
        Ok(())
    }

    /// Rewrites a pending negative degree-minutes value; other writes can
    /// reset it on the device side.
    async fn reassert_degree_minutes(&mut self) -> Result<()> {
        if self.dm.value < 0.0 {
            let dm = self.dm.value;
            self.write_degree_minutes(dm).await?;
        }
        Ok(())
    }

    /// Read-verify-retry loop for one register write. Aborts when the
    /// operator mode changed mid-sequence (no abort check during init,
    /// signalled by `expected == None`).
    async fn write_verified(&mut self, id: u16, value: f64, expected: Option<Mode>) -> Result<()> {
        for _ in 0..self.timing.write_retries {
            let current = self
                .dev
                .get_register_value(id, Some(Duration::ZERO))
                .await?;
            if (current - value).abs() < 1e-6 {
                return Ok(());
            }
            self.check_mode(expected)?;
            self.dev.write_register(id, value).await?;
            self.reassert_degree_minutes().await?;
        }
        Err(Error::Response(format!(
            "register {id} did not verify to {value}"
        )))
    }

    fn check_mode(&self, expected: Option<Mode>) -> Result<()> {
        let Some(expected) = expected else {
            return Ok(());
        };
        let current = self.config_rx.borrow().mode();
        if current == expected {
            Ok(())
        } else {
            Err(Error::StateAborted {
                expected: expected.name(),
            })
        }
    }

    fn cached(&self, id: u16) -> f64 {
        self.dev.value(id).map(|v| v.scaled).unwrap_or(f64::NAN)
    }

    fn publish_snapshot(&self) {
        let snapshot = Snapshot {
            config: self.config.clone(),
            state: self.state,
            f_compressor: self.cached(COMPRESSOR_FREQUENCY),
            p_add_heater: self.cached(ADD_HEATER_POWER),
            t_supply: self.cached(SUPPLY_TEMP),
            t_supply_return: self.cached(SUPPLY_RETURN_TEMP),
            t_condenser_out: self.cached(CONDENSER_OUT_TEMP),
            speed_brine_pump: self.cached(BRINE_PUMP_SPEED),
            speed_supply_pump: self.cached(SUPPLY_PUMP_SPEED),
        };
        let _ = self.snapshot_tx.send(snapshot);
    }
}

/// Initial degree-minutes as a step function of the requested frequency.
fn initial_degree_minutes(f_setpoint: f64) -> f64 {
    if f_setpoint >= 80.0 {
        -300.0
    } else if f_setpoint >= 60.0 {
        -250.0
    } else if f_setpoint >= 40.0 {
        -200.0
    } else if f_setpoint >= 20.0 {
        -150.0
    } else {
        100.0
    }
}

/// Coarse, rate-limited integral step toward the target frequency.
fn dm_step(diff: f64) -> f64 {
    if diff > 5.0 {
        2.0
    } else if diff > 0.0 {
        1.0
    } else if diff > -0.5 {
        0.0
    } else if diff > -5.0 {
        -2.0
    } else {
        -1.0
    }
}

fn f_max_for_condenser(t_condenser_out: f64) -> f64 {
    if t_condenser_out > T_CONDENSER_REDUCE {
        F_MAX_HOT_CONDENSER
    } else {
        F_MAX
    }
}

fn watts_to_kilowatts(watts: f64) -> f64 {
    watts / 1000.0
}

/// Band placement for a target frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CutOffPlan {
    band1: (f64, f64),
    /// `None` deactivates band 2.
    band2: Option<(f64, f64)>,
}

/// Decides which forbidden bands must be active for `f_target`.
///
/// Below band 1 both bands are active, with band 2's lower edge pulled
/// down to just above the padded target (its minimum width enforced);
/// otherwise only band 1 is active.
fn cut_off_plan(f_target: f64) -> CutOffPlan {
    let padded = f_target + CUT_OFF_PADDING;
    if padded < CUT_OFF_BAND_1.0 {
        let start2 = padded.min(CUT_OFF_BAND_2.1 - CUT_OFF_MIN_WIDTH);
        CutOffPlan {
            band1: CUT_OFF_BAND_1,
            band2: Some((start2, CUT_OFF_BAND_2.1)),
        }
    } else {
        CutOffPlan {
            band1: CUT_OFF_BAND_1,
            band2: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Catalog;
    use crate::testutil::{spawn_fake_pump, FakeRegisters};
    use crate::transport::{ModbusSerial, Timing as TransportTiming};
    use assert_matches::assert_matches;

    fn raw_s16(value: f64, scale: f64) -> u16 {
        ((value / scale).round() as i64 & 0xffff) as u16
    }

    async fn stack(
        config: HeatPumpConfig,
    ) -> (HeatPump, HeatPumpHandle, Nibe1155, FakeRegisters) {
        let (ours, theirs) = tokio::io::duplex(16384);
        let registers = spawn_fake_pump(theirs);
        let serial = ModbusSerial::attach(
            ours,
            TransportTiming {
                fast: Duration::from_millis(500),
                normal: Duration::from_millis(500),
                margin: Duration::from_millis(100),
                caller_extra: Duration::from_millis(5000),
            },
        );
        let dev = Nibe1155::start(serial, Catalog::new(), Duration::from_millis(10));
        let timing = Timing {
            tick: Duration::from_millis(10),
            wait_step: Duration::from_millis(30),
            switch_bound: Duration::from_millis(600),
            dm_interval: Duration::ZERO,
            max_value_age: Duration::from_secs(5),
            write_retries: 5,
        };
        let (controller, handle) =
            HeatPump::new(dev.clone(), config, DmLog::disabled(), timing).unwrap();
        (controller, handle, dev, registers)
    }

    /// Lets the polling scheduler pick up freshly seeded register values
    /// before the controller reads them through the cache.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    /// Standard plant reaction: writing exactly the switch-on value starts
    /// the compressor and both pumps, a non-negative value stops them.
    fn plant_reacts(registers: &FakeRegisters) {
        registers.on_write(|map, id, value| {
            if id == DEGREE_MINUTES {
                let dm = value as i16;
                if dm == -1000 {
                    map.insert(COMPRESSOR_FREQUENCY, 500);
                    map.insert(SUPPLY_PUMP_SPEED, 50);
                    map.insert(BRINE_PUMP_SPEED, 50);
                } else if dm >= 0 {
                    map.insert(COMPRESSOR_FREQUENCY, 0);
                    map.insert(SUPPLY_PUMP_SPEED, 0);
                    map.insert(BRINE_PUMP_SPEED, 0);
                }
            }
        });
    }

    #[test]
    fn config_validation() {
        assert!(HeatPumpConfig::Off.validate().is_ok());
        assert!(HeatPumpConfig::Frequency {
            f_setpoint: 50.0,
            p_add_heater: 0.0
        }
        .validate()
        .is_ok());
        assert_matches!(
            HeatPumpConfig::Frequency {
                f_setpoint: 10.0,
                p_add_heater: 0.0
            }
            .validate(),
            Err(Error::Config(_))
        );
        assert_matches!(
            HeatPumpConfig::Frequency {
                f_setpoint: 50.0,
                p_add_heater: 9000.0
            }
            .validate(),
            Err(Error::Config(_))
        );
        assert_matches!(
            HeatPumpConfig::Temperature {
                f_setpoint: 50.0,
                t_min: 40.0,
                t_max: 30.0
            }
            .validate(),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn initial_degree_minutes_buckets() {
        assert_eq!(initial_degree_minutes(85.0), -300.0);
        assert_eq!(initial_degree_minutes(80.0), -300.0);
        assert_eq!(initial_degree_minutes(60.0), -250.0);
        assert_eq!(initial_degree_minutes(50.0), -200.0);
        assert_eq!(initial_degree_minutes(40.0), -200.0);
        assert_eq!(initial_degree_minutes(20.0), -150.0);
        assert_eq!(initial_degree_minutes(10.0), 100.0);
    }

    #[test]
    fn dm_step_table() {
        assert_eq!(dm_step(6.0), 2.0);
        assert_eq!(dm_step(3.0), 1.0);
        assert_eq!(dm_step(0.0), 0.0);
        assert_eq!(dm_step(-0.4), 0.0);
        assert_eq!(dm_step(-3.0), -2.0);
        assert_eq!(dm_step(-10.0), -1.0);
    }

    // Regression pin for the band algorithm as implemented; the band-2
    // edge handling is kept literal until the asymmetry question around
    // it is resolved.
    #[test]
    fn cut_off_plan_pinned() {
        // padded target 55 is not below band 1: band 1 only
        let plan = cut_off_plan(50.0);
        assert_eq!(plan.band1, (47.0, 58.0));
        assert_eq!(plan.band2, None);
        // padded target 35 is below band 1: both bands, band 2 pulled down
        let plan = cut_off_plan(30.0);
        assert_eq!(plan.band2, Some((35.0, 118.0)));
        // high targets keep band 1 only
        let plan = cut_off_plan(115.0);
        assert_eq!(plan.band2, None);
        // boundary of the band-1 comparison
        let plan = cut_off_plan(41.0);
        assert_eq!(plan.band2, Some((46.0, 118.0)));
        assert_eq!(cut_off_plan(42.0).band2, None);
    }

    #[tokio::test]
    async fn init_scenario_frequency_50() {
        let (mut controller, _handle, _dev, registers) = stack(HeatPumpConfig::Frequency {
            f_setpoint: 50.0,
            p_add_heater: 0.0,
        })
        .await;
        registers.set(CONDENSER_OUT_TEMP, raw_s16(40.0, 0.1));
        plant_reacts(&registers);

        // first tick: init writes the -200 bucket, drives the additive
        // heater limit to zero and applies bands for ~55 Hz
        controller.tick().await;
        assert_eq!(controller.state, State::Frequency);
        assert_eq!(controller.dm.value, -200.0);
        assert_eq!(registers.get(DEGREE_MINUTES), Some(raw_s16(-200.0, 0.1)));
        assert_eq!(registers.get(CUT_OFF_START_1), Some(47));
        assert_eq!(registers.get(CUT_OFF_STOP_1), Some(58));
        assert_eq!(registers.get(CUT_OFF_ACTIVATED_1), Some(1));
        assert!(matches!(registers.get(CUT_OFF_ACTIVATED_2), None | Some(0)));
        assert!(matches!(registers.get(MAX_ADD_POWER), None | Some(0)));

        // second tick: compressor reads zero, switch-on forces -100 and
        // the plant comes up
        controller.tick().await;
        assert_eq!(controller.state, State::Frequency);
        assert_eq!(registers.get(DEGREE_MINUTES), Some(raw_s16(-100.0, 0.1)));
        assert_eq!(registers.get(COMPRESSOR_FREQUENCY), Some(500));
    }

    #[tokio::test]
    async fn hot_condenser_forces_switch_off() {
        let (mut controller, _handle, _dev, registers) = stack(HeatPumpConfig::Frequency {
            f_setpoint: 50.0,
            p_add_heater: 0.0,
        })
        .await;
        registers.set(CONDENSER_OUT_TEMP, raw_s16(63.0, 0.1));
        registers.set(COMPRESSOR_FREQUENCY, 500);
        registers.set(SUPPLY_PUMP_SPEED, 50);
        registers.set(BRINE_PUMP_SPEED, 50);
        plant_reacts(&registers);
        settle().await;

        controller.tick().await; // init
        controller.tick().await; // frequency: condenser above 62 °C
        assert_eq!(controller.state, State::Frequency);
        // no evaluation was queued for the scheduler
        assert!(controller.dev.pending_degree_minutes().is_none());
        // the forced switch-off removed all heat demand
        assert_eq!(registers.get(DEGREE_MINUTES), Some(raw_s16(1.0, 0.1)));
        assert_eq!(registers.get(MAX_ADD_POWER), Some(0));
        assert_eq!(
            registers.get(SUPPLY_PUMP_MODE),
            Some(pump_mode::ECONOMY as u16)
        );
        assert_eq!(registers.get(BRINE_PUMP_MODE), Some(pump_mode::AUTO as u16));

        // the update function returns the prior accumulator unchanged
        controller.state = State::Frequency;
        controller.dm.value = -300.0;
        let value = controller
            .update_degree_minutes(50.0, 50.0, 0.0, None)
            .await
            .unwrap();
        assert_eq!(value, -300.0);
    }

    #[tokio::test]
    async fn degree_minutes_floor_holds() {
        let (mut controller, _handle, _dev, registers) = stack(HeatPumpConfig::Frequency {
            f_setpoint: 90.0,
            p_add_heater: 0.0,
        })
        .await;
        registers.set(CONDENSER_OUT_TEMP, raw_s16(40.0, 0.1));
        registers.set(COMPRESSOR_FREQUENCY, 200); // 20 Hz, far below target
        settle().await;
        controller.tick().await; // init
        controller.state = State::Frequency;
        controller.dm.value = -1199.5;
        let value = controller
            .update_degree_minutes(90.0, 90.0, 0.0, None)
            .await
            .unwrap();
        assert_eq!(value, DM_FLOOR);
        let again = controller
            .update_degree_minutes(90.0, 90.0, 0.0, None)
            .await
            .unwrap();
        assert_eq!(again, DM_FLOOR);
    }

    #[tokio::test]
    async fn additive_heating_clamps_to_preset() {
        let (mut controller, _handle, _dev, registers) = stack(HeatPumpConfig::Frequency {
            f_setpoint: 50.0,
            p_add_heater: 2000.0,
        })
        .await;
        registers.set(CONDENSER_OUT_TEMP, raw_s16(40.0, 0.1));
        registers.set(COMPRESSOR_FREQUENCY, 500);
        settle().await;
        controller.tick().await; // init
        controller.state = State::Frequency;
        controller.dm.value = -200.0;
        let value = controller
            .update_degree_minutes(50.0, 50.0, 2000.0, None)
            .await
            .unwrap();
        assert_eq!(value, -450.0);
        // the additive heater limit was driven to 2 kW during init
        assert_eq!(registers.get(MAX_ADD_POWER), Some(200));
    }

    #[tokio::test]
    async fn temperature_mode_switches_off_above_t_max() {
        let (mut controller, _handle, _dev, registers) = stack(HeatPumpConfig::Temperature {
            f_setpoint: 50.0,
            t_min: 30.0,
            t_max: 35.0,
        })
        .await;
        registers.set(CONDENSER_OUT_TEMP, raw_s16(40.0, 0.1));
        registers.set(SUPPLY_TEMP, raw_s16(36.0, 0.1));
        registers.set(COMPRESSOR_FREQUENCY, 500);
        registers.set(SUPPLY_PUMP_SPEED, 50);
        registers.set(BRINE_PUMP_SPEED, 50);
        plant_reacts(&registers);
        settle().await;

        controller.tick().await; // init
        assert_eq!(controller.state, State::Temperature);
        controller.tick().await; // supply above t_max while running
        assert_eq!(registers.get(DEGREE_MINUTES), Some(raw_s16(1.0, 0.1)));
        assert_eq!(registers.get(COMPRESSOR_FREQUENCY), Some(0));
    }

    #[tokio::test]
    async fn mode_change_aborts_bounded_wait() {
        let (mut controller, handle, _dev, registers) = stack(HeatPumpConfig::Frequency {
            f_setpoint: 50.0,
            p_add_heater: 0.0,
        })
        .await;
        registers.set(CONDENSER_OUT_TEMP, raw_s16(40.0, 0.1));
        settle().await;
        // no plant reaction: the compressor never starts
        controller.tick().await; // init
        let aborter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.set_config(HeatPumpConfig::Off).unwrap();
        });
        let result = controller
            .switch_on(Duration::from_secs(5), Some(Mode::Frequency))
            .await;
        assert_matches!(result, Err(Error::StateAborted { expected: "frequency" }));
        aborter.await.unwrap();
    }

    #[tokio::test]
    async fn temp_limit_shadowing_avoids_redundant_writes() {
        let (mut controller, _handle, _dev, registers) = stack(HeatPumpConfig::Frequency {
            f_setpoint: 50.0,
            p_add_heater: 0.0,
        })
        .await;
        registers.set(SUPPLY_TEMP, raw_s16(30.0, 0.1));
        settle().await;
        controller.refresh_temp_limits().await.unwrap();
        assert_eq!(registers.get(HEAT_TEMP_MIN), Some(raw_s16(30.1, 0.1)));
        assert_eq!(registers.get(HEAT_TEMP_MAX), Some(raw_s16(30.1, 0.1)));
        let writes_after_first = registers.writes();

        // within the band: no further writes
        registers.set(SUPPLY_TEMP, raw_s16(30.2, 0.1));
        tokio::time::sleep(Duration::from_millis(30)).await; // let polling refresh
        controller.refresh_temp_limits().await.unwrap();
        assert_eq!(registers.writes(), writes_after_first);

        // outside the band: rewritten
        registers.set(SUPPLY_TEMP, raw_s16(30.5, 0.1));
        tokio::time::sleep(Duration::from_millis(30)).await;
        controller.refresh_temp_limits().await.unwrap();
        assert!(registers.writes() > writes_after_first);
        assert_eq!(registers.get(HEAT_TEMP_MIN), Some(raw_s16(30.6, 0.1)));
    }

    #[tokio::test]
    async fn rejected_config_leaves_controller_untouched() {
        let (mut controller, handle, _dev, registers) = stack(HeatPumpConfig::Off).await;
        plant_reacts(&registers);
        settle().await;
        controller.tick().await;
        assert_eq!(controller.state, State::Off);
        assert_matches!(
            handle.set_config(HeatPumpConfig::Frequency {
                f_setpoint: 500.0,
                p_add_heater: 0.0
            }),
            Err(Error::Config(_))
        );
        controller.tick().await;
        assert_eq!(controller.config, HeatPumpConfig::Off);
        assert_eq!(controller.state, State::Off);
    }

    #[tokio::test]
    async fn accepted_config_restarts_from_init() {
        let (mut controller, handle, _dev, registers) = stack(HeatPumpConfig::Off).await;
        registers.set(CONDENSER_OUT_TEMP, raw_s16(40.0, 0.1));
        plant_reacts(&registers);
        settle().await;
        controller.tick().await;
        assert_eq!(controller.state, State::Off);
        handle
            .set_config(HeatPumpConfig::Frequency {
                f_setpoint: 65.0,
                p_add_heater: 0.0,
            })
            .unwrap();
        controller.tick().await;
        // the replacing tick ran init with the -250 bucket
        assert_eq!(controller.state, State::Frequency);
        assert_eq!(registers.get(DEGREE_MINUTES), Some(raw_s16(-250.0, 0.1)));
    }
}
