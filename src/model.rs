use num_traits::FromPrimitive as _;
use strum::{EnumCount as _, IntoEnumIterator as _};
use tokio::time::Instant;

/// A named slice of controller configuration with its own version counter.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumIter,
    strum::EnumCount,
    num_derive::FromPrimitive,
    num_derive::ToPrimitive,
    serde::Serialize,
)]
#[strum(serialize_all = "camelCase")]
#[repr(u8)]
pub enum Category {
    Equipment = 0,
    Options = 1,
    Circuits = 2,
    Features = 3,
    Pumps = 4,
    Heaters = 5,
    Chlorinators = 6,
    Valves = 7,
    Schedules = 8,
    CircuitGroups = 9,
    General = 10,
}

impl Category {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::from_u8(byte)
    }
}

/// Per-category version counters used to detect configuration drift between the
/// local model and the panel. 0 is the "unattained" sentinel that forces a re-query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct ConfigVersion([u32; Category::COUNT]);

impl ConfigVersion {
    pub fn get(&self, category: Category) -> u32 {
        self.0[category as usize]
    }

    pub fn set(&mut self, category: Category, version: u32) {
        self.0[category as usize] = version;
    }

    pub fn with(mut self, category: Category, version: u32) -> Self {
        self.set(category, version);
        self
    }

    /// A category is dirty when either side has never been attained or the counters differ.
    pub fn is_dirty(&self, remote: &ConfigVersion, category: Category) -> bool {
        let local = self.get(category);
        let theirs = remote.get(category);
        local == 0 || theirs == 0 || local != theirs
    }

    pub fn has_changes(&self, remote: &ConfigVersion) -> bool {
        Category::iter().any(|c| self.is_dirty(remote, c))
    }

    pub fn dirty_categories(&self, remote: &ConfigVersion) -> Vec<Category> {
        Category::iter().filter(|&c| self.is_dirty(remote, c)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TempUnits {
    #[default]
    Fahrenheit,
    Celsius,
}

/// Capacity facts about the installed panel and expansion modules.
#[derive(Debug, Clone, Default)]
pub struct EquipmentLimits {
    pub max_circuits: u8,
    pub max_features: u8,
    pub max_bodies: u8,
    pub max_pumps: u8,
    pub max_schedules: u8,
    pub max_circuit_groups: u8,
    /// One pump plumbed to both bodies; pool and spa circuits interlock.
    pub shared: bool,
    pub dual: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Circuit {
    pub id: u8,
    pub name: String,
    /// Byte code into the family's circuitFunctions value map.
    pub function: u8,
    pub is_on: bool,
    /// Automatic shut-off duration in minutes.
    pub egg_timer: Option<u16>,
    /// Byte code into the family's lightThemes value map, for light-function circuits.
    pub theme: Option<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Body {
    pub id: u8,
    pub name: String,
    pub setpoint: u8,
    pub cool_setpoint: Option<u8>,
    /// Byte code into the family's heatModes value map.
    pub heat_mode: u8,
    pub temp: Option<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Pump {
    pub id: u8,
    pub name: String,
    /// Byte code into the family's pumpTypes value map.
    pub pump_type: u8,
    pub speed: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterType {
    Gas,
    Solar,
    HeatPump,
    Ultratemp,
}

#[derive(Debug, Clone)]
pub struct Heater {
    pub id: u8,
    pub body: u8,
    pub heater_type: HeaterType,
}

#[derive(Debug, Clone, Default)]
pub struct Chlorinator {
    pub id: u8,
    pub pool_setpoint: u8,
    pub spa_setpoint: u8,
    pub super_chlorinate: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub id: u8,
    pub circuit: u8,
    /// Minutes after midnight.
    pub start_time: u16,
    pub end_time: u16,
    /// Day-of-week bitmask, Sunday = bit 0.
    pub days: u8,
}

/// The shared in-memory picture of installed equipment and its live state.
///
/// Read by command builders for validation and defaults; written only from response
/// callbacks, status-frame application and configuration completion.
#[derive(Debug, Clone, Default)]
pub struct EquipmentModel {
    pub limits: EquipmentLimits,
    pub temp_units: TempUnits,
    pub circuits: Vec<Circuit>,
    pub bodies: Vec<Body>,
    pub pumps: Vec<Pump>,
    pub heaters: Vec<Heater>,
    pub chlorinators: Vec<Chlorinator>,
    pub schedules: Vec<Schedule>,
    pub versions: ConfigVersion,
    pub last_updated: Option<Instant>,
}

impl EquipmentModel {
    pub fn circuit(&self, id: u8) -> Option<&Circuit> {
        self.circuits.iter().find(|c| c.id == id)
    }

    pub fn circuit_mut(&mut self, id: u8) -> Option<&mut Circuit> {
        self.circuits.iter_mut().find(|c| c.id == id)
    }

    /// Fetches the circuit, creating a placeholder record for ids the configuration
    /// sync has not described yet.
    pub fn circuit_entry(&mut self, id: u8) -> &mut Circuit {
        if self.circuit(id).is_none() {
            self.circuits.push(Circuit { id, ..Circuit::default() });
            self.circuits.sort_by_key(|c| c.id);
        }
        self.circuit_mut(id).unwrap_or_else(|| unreachable!())
    }

    pub fn body(&self, id: u8) -> Option<&Body> {
        self.bodies.iter().find(|b| b.id == id)
    }

    pub fn body_mut(&mut self, id: u8) -> Option<&mut Body> {
        self.bodies.iter_mut().find(|b| b.id == id)
    }

    pub fn pump(&self, id: u8) -> Option<&Pump> {
        self.pumps.iter().find(|p| p.id == id)
    }

    pub fn chlorinator(&self, id: u8) -> Option<&Chlorinator> {
        self.chlorinators.iter().find(|c| c.id == id)
    }

    pub fn schedule(&self, id: u8) -> Option<&Schedule> {
        self.schedules.iter().find(|s| s.id == id)
    }

    /// First free id in the schedule range, for callers that pass id 0.
    pub fn next_schedule_id(&self) -> Option<u8> {
        (1..=self.limits.max_schedules).find(|id| self.schedule(*id).is_none())
    }
}
