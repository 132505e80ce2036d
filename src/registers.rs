//! Static register catalog for the NIBE 1155 MODBUS 40 interface.
//!
//! One immutable descriptor per register, keyed by the vendor's 1-based
//! register id, with a secondary lookup by label. The catalog also fixes
//! the two polling partitions: the LOG.SET block the device refreshes at
//! high rate (read as grouped block reads every scheduler tick) and the
//! slow set read individually round-robin.

use std::collections::HashMap;

/// Width and signedness of a register's raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
}

impl Size {
    /// Number of 16-bit wire words the register occupies.
    pub fn words(self) -> u16 {
        match self {
            Size::U32 | Size::S32 => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Immutable decoding metadata for one register.
#[derive(Debug)]
pub struct Register {
    pub id: u16,
    pub label: &'static str,
    pub size: Size,
    /// Multiplicative scale: `scaled = raw as f64 * scale`.
    pub scale: f64,
    pub access: Access,
    pub unit: &'static str,
    pub description: &'static str,
}

// Register ids the controller addresses directly.
pub const OUTDOOR_TEMP: u16 = 40004;
pub const SUPPLY_S1_TEMP: u16 = 40008;
pub const SUPPLY_RETURN_TEMP: u16 = 40012;
pub const BRINE_IN_TEMP: u16 = 40015;
pub const BRINE_OUT_TEMP: u16 = 40016;
pub const CONDENSER_OUT_TEMP: u16 = 40017;
pub const HOT_GAS_TEMP: u16 = 40018;
pub const LIQUID_LINE_TEMP: u16 = 40019;
pub const SUCTION_TEMP: u16 = 40022;
pub const SUPPLY_TEMP: u16 = 40071;
pub const DEGREE_MINUTES: u16 = 43005;
pub const ADD_HEATER_POWER: u16 = 43084;
pub const COMPRESSOR_FREQUENCY: u16 = 43136;
pub const COMPRESSOR_IN_POWER: u16 = 43141;
pub const COMPRESSOR_STATE: u16 = 43427;
pub const SUPPLY_PUMP_STATE: u16 = 43431;
pub const BRINE_PUMP_STATE: u16 = 43433;
pub const SUPPLY_PUMP_SPEED: u16 = 43437;
pub const BRINE_PUMP_SPEED: u16 = 43439;
pub const HEAT_TEMP_MIN: u16 = 47015;
pub const HEAT_TEMP_MAX: u16 = 47019;
pub const SUPPLY_PUMP_MODE: u16 = 47138;
pub const BRINE_PUMP_MODE: u16 = 47139;
pub const MAX_ADD_POWER: u16 = 47212;
pub const AUTO_PUMP_SPEED: u16 = 48453;
pub const CUT_OFF_ACTIVATED_2: u16 = 48659;
pub const CUT_OFF_ACTIVATED_1: u16 = 48660;
pub const CUT_OFF_START_2: u16 = 48661;
pub const CUT_OFF_START_1: u16 = 48662;
pub const CUT_OFF_STOP_2: u16 = 48663;
pub const CUT_OFF_STOP_1: u16 = 48664;

/// Operational pump modes written to [`SUPPLY_PUMP_MODE`] / [`BRINE_PUMP_MODE`].
pub mod pump_mode {
    pub const INTERMITTENT: f64 = 10.0;
    pub const CONTINUOUS: f64 = 20.0;
    pub const ECONOMY: f64 = 30.0;
    pub const AUTO: f64 = 40.0;
}

use self::Access::{ReadOnly as R, ReadWrite as RW};
use self::Size::*;

#[rustfmt::skip]
pub const REGISTERS: &[Register] = &[
    Register { id: 40004, label: "outdoorTemp",         size: S16, scale: 0.1,  access: R,  unit: "°C", description: "Outdoor temperature (BT1)" },
    Register { id: 40008, label: "supplyS1Temp",        size: S16, scale: 0.1,  access: R,  unit: "°C", description: "Supply S1 temperature (BT2)" },
    Register { id: 40012, label: "supplyReturnTemp",    size: S16, scale: 0.1,  access: R,  unit: "°C", description: "Supply return temperature (BT3)" },
    Register { id: 40015, label: "brineInTemp",         size: S16, scale: 0.1,  access: R,  unit: "°C", description: "Brine-in temperature (BT10)" },
    Register { id: 40016, label: "brineOutTemp",        size: S16, scale: 0.1,  access: R,  unit: "°C", description: "Brine-out temperature (BT11)" },
    Register { id: 40017, label: "condenserOutTemp",    size: S16, scale: 0.1,  access: R,  unit: "°C", description: "Condenser-out temperature (BT12)" },
    Register { id: 40018, label: "hotGasTemp",          size: S16, scale: 0.1,  access: R,  unit: "°C", description: "Hot gas temperature (BT14)" },
    Register { id: 40019, label: "liquidLineTemp",      size: S16, scale: 0.1,  access: R,  unit: "°C", description: "Liquid line temperature (BT15)" },
    Register { id: 40022, label: "suctionTemp",         size: S16, scale: 0.1,  access: R,  unit: "°C", description: "Suction temperature (BT17)" },
    Register { id: 40067, label: "outdoorTempAvg",      size: S16, scale: 0.1,  access: R,  unit: "°C", description: "Outdoor temperature (BT1) average" },
    Register { id: 40071, label: "supplyTemp",          size: S16, scale: 0.1,  access: R,  unit: "°C", description: "External supply temperature (BT25)" },
    Register { id: 43005, label: "degreeMinutes",       size: S16, scale: 0.1,  access: RW, unit: "",   description: "Degree minutes (16 bit)" },
    Register { id: 43084, label: "electricHeaterPower", size: S16, scale: 10.0, access: R,  unit: "W",  description: "Current power from internal electric addition" },
    Register { id: 43122, label: "allowedFreqMin",      size: S16, scale: 1.0,  access: R,  unit: "Hz", description: "Compressor current minimum frequency" },
    Register { id: 43123, label: "allowedFreqMax",      size: S16, scale: 1.0,  access: R,  unit: "Hz", description: "Compressor current maximum frequency" },
    Register { id: 43136, label: "compressorFrequency", size: U16, scale: 0.1,  access: R,  unit: "Hz", description: "Compressor frequency" },
    Register { id: 43141, label: "compressorInPower",   size: U16, scale: 10.0, access: R,  unit: "W",  description: "Compressor in power" },
    Register { id: 43416, label: "compressorStarts",    size: S32, scale: 1.0,  access: R,  unit: "",   description: "Number of compressor starts" },
    Register { id: 43420, label: "compressorOpTime",    size: S32, scale: 1.0,  access: R,  unit: "h",  description: "Compressor total operation time" },
    Register { id: 43427, label: "compressorState",     size: U8,  scale: 1.0,  access: R,  unit: "",   description: "Compressor state (20=stop,40=start,60=run,100=stopping)" },
    Register { id: 43431, label: "supplyPumpState",     size: U8,  scale: 1.0,  access: R,  unit: "",   description: "Supply pump state (10=off,15=start,20=on,40=10day,80=cal)" },
    Register { id: 43433, label: "brinePumpState",      size: U8,  scale: 1.0,  access: R,  unit: "",   description: "Brine pump state (10=off,15=start,20=on,40=10day,80=cal)" },
    Register { id: 43437, label: "supplyPumpSpeed",     size: U8,  scale: 1.0,  access: R,  unit: "%",  description: "Supply pump speed" },
    Register { id: 43439, label: "brinePumpSpeed",      size: U8,  scale: 1.0,  access: R,  unit: "%",  description: "Brine pump speed" },
    Register { id: 45001, label: "alarmNumber",         size: S16, scale: 1.0,  access: R,  unit: "",   description: "Most severe alarm number" },
    Register { id: 47015, label: "heatTempMin",         size: S16, scale: 0.1,  access: RW, unit: "°C", description: "Minimum supply temperature S1" },
    Register { id: 47019, label: "heatTempMax",         size: S16, scale: 0.1,  access: RW, unit: "°C", description: "Maximum supply temperature S1" },
    Register { id: 47138, label: "supplyPumpMode",      size: U8,  scale: 1.0,  access: RW, unit: "",   description: "Operational mode heat medium pump" },
    Register { id: 47139, label: "brinePumpMode",       size: U8,  scale: 1.0,  access: RW, unit: "",   description: "Operational mode brine pump" },
    Register { id: 47212, label: "maxAddPower",         size: S16, scale: 0.01, access: RW, unit: "kW", description: "Maximum internal additive heater power" },
    Register { id: 48453, label: "autoPumpSpeed",       size: S8,  scale: 1.0,  access: RW, unit: "%",  description: "Auto heat medium pump speed" },
    Register { id: 48659, label: "cutOffFreqActivated2", size: S8, scale: 1.0,  access: RW, unit: "",   description: "Cut-off frequency band 2 activated" },
    Register { id: 48660, label: "cutOffFreqActivated1", size: S8, scale: 1.0,  access: RW, unit: "",   description: "Cut-off frequency band 1 activated" },
    Register { id: 48661, label: "cutOffFreqStart2",    size: U8,  scale: 1.0,  access: RW, unit: "Hz", description: "Cut-off frequency band 2 start" },
    Register { id: 48662, label: "cutOffFreqStart1",    size: U8,  scale: 1.0,  access: RW, unit: "Hz", description: "Cut-off frequency band 1 start" },
    Register { id: 48663, label: "cutOffFreqStop2",     size: U8,  scale: 1.0,  access: RW, unit: "Hz", description: "Cut-off frequency band 2 stop" },
    Register { id: 48664, label: "cutOffFreqStop1",     size: U8,  scale: 1.0,  access: RW, unit: "Hz", description: "Cut-off frequency band 1 stop" },
];

/// LOG.SET ids: the vendor's high-refresh-rate block, polled every tick.
pub const LOG_SET_IDS: &[u16] = &[
    40004, 40008, 40012, 40015, 40016, 40017, 40018, 40019, 40022, 40071, 43005, 43084, 43136,
    43141, 43427, 43431, 43433, 43437, 43439,
];

/// Registers outside LOG.SET, read individually one per idle tick.
pub const SLOW_IDS: &[u16] = &[
    40067, 43122, 43123, 43416, 43420, 45001, 47015, 47019, 47138, 47139, 47212, 48453, 48659,
    48660, 48661, 48662, 48663, 48664,
];

/// Lookup tables over [`REGISTERS`], built once by the composition root.
#[derive(Debug)]
pub struct Catalog {
    by_id: HashMap<u16, &'static Register>,
    by_label: HashMap<&'static str, &'static Register>,
}

impl Catalog {
    /// Builds the id and label indexes and asserts they are mutually
    /// consistent (every label resolves to the descriptor whose id maps
    /// back to it, all polling ids exist).
    pub fn new() -> Self {
        let mut by_id = HashMap::with_capacity(REGISTERS.len());
        let mut by_label = HashMap::with_capacity(REGISTERS.len());
        for reg in REGISTERS {
            assert!(
                by_id.insert(reg.id, reg).is_none(),
                "duplicate register id {}",
                reg.id
            );
            assert!(
                by_label.insert(reg.label, reg).is_none(),
                "duplicate register label {}",
                reg.label
            );
        }
        for id in LOG_SET_IDS.iter().chain(SLOW_IDS) {
            assert!(by_id.contains_key(id), "polled register {id} not in catalog");
        }
        Self { by_id, by_label }
    }

    pub fn by_id(&self, id: u16) -> Option<&'static Register> {
        self.by_id.get(&id).copied()
    }

    pub fn by_label(&self, label: &str) -> Option<&'static Register> {
        self.by_label.get(label).copied()
    }

    /// All descriptors in id order.
    pub fn iter(&self) -> impl Iterator<Item = &'static Register> + '_ {
        REGISTERS.iter()
    }

    /// Contiguous `(first_id, quantity)` runs of the LOG.SET block, so the
    /// whole block needs as few grouped reads as the address runs allow.
    pub fn log_set_groups(&self) -> Vec<(u16, u16)> {
        let mut groups = Vec::new();
        let mut i = 0;
        while i < LOG_SET_IDS.len() {
            let first = LOG_SET_IDS[i];
            let mut last = first;
            while i + 1 < LOG_SET_IDS.len() && LOG_SET_IDS[i + 1] == last + 1 {
                i += 1;
                last = LOG_SET_IDS[i];
            }
            groups.push((first, last - first + 1));
            i += 1;
        }
        groups
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_consistent() {
        let catalog = Catalog::new();
        for reg in REGISTERS {
            let by_id = catalog.by_id(reg.id).unwrap();
            let by_label = catalog.by_label(reg.label).unwrap();
            assert_eq!(by_id.id, by_label.id);
            assert_eq!(by_id.label, by_label.label);
        }
    }

    #[test]
    fn log_set_groups_are_contiguous_runs() {
        let catalog = Catalog::new();
        let groups = catalog.log_set_groups();
        // 40015..=40019 is the single run of five, the rest are singletons
        assert!(groups.contains(&(40015, 5)));
        let total: u16 = groups.iter().map(|(_, q)| q).sum();
        assert_eq!(total as usize, LOG_SET_IDS.len());
        for (first, quantity) in groups {
            for id in first..first + quantity {
                assert!(LOG_SET_IDS.contains(&id));
            }
        }
    }

    #[test]
    fn partitions_do_not_overlap() {
        for id in LOG_SET_IDS {
            assert!(!SLOW_IDS.contains(id));
        }
    }
}
