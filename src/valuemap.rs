use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::model::{EquipmentModel, HeaterType};

/// Semantic description of one raw protocol byte code.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValueDescriptor {
    pub name: Cow<'static, str>,
    pub desc: Cow<'static, str>,
    /// Whether circuits of this function can carry light themes.
    pub is_light: bool,
}

impl ValueDescriptor {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        desc: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self { name: name.into(), desc: desc.into(), is_light: false }
    }

    pub fn light(mut self) -> Self {
        self.is_light = true;
        self
    }
}

/// A resolved descriptor together with the byte it stands for.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValueTag {
    pub val: u8,
    pub name: Cow<'static, str>,
    pub desc: Cow<'static, str>,
    pub is_light: bool,
}

/// Bidirectional mapping between protocol byte codes and semantic descriptors.
///
/// Owned by the board adapter; replaced wholesale (never mutated in place) when
/// installed-equipment facts change a table, see [`derive_heat_modes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueMap {
    entries: BTreeMap<u8, ValueDescriptor>,
}

impl ValueMap {
    pub fn new(entries: impl IntoIterator<Item = (u8, ValueDescriptor)>) -> Self {
        Self { entries: entries.into_iter().collect() }
    }

    /// Total transformation of a byte into a tag. Unknown bytes resolve to the
    /// byte-0 entry when one exists, and to a synthesized "unknown" tag otherwise.
    pub fn transform(&self, byte: u8) -> ValueTag {
        let descriptor = self.entries.get(&byte).or_else(|| self.entries.get(&0));
        match descriptor {
            Some(d) => ValueTag {
                val: byte,
                name: d.name.clone(),
                desc: d.desc.clone(),
                is_light: d.is_light,
            },
            None => ValueTag {
                val: byte,
                name: Cow::Borrowed("unknown"),
                desc: Cow::Borrowed("Unknown"),
                is_light: false,
            },
        }
    }

    /// Reverse lookup by name. Unknown names yield the 0 sentinel rather than failing.
    pub fn get_value(&self, name: &str) -> u8 {
        self.entries
            .iter()
            .find(|(_, d)| d.name == name)
            .map(|(byte, _)| *byte)
            .unwrap_or(0)
    }

    pub fn get_name(&self, byte: u8) -> Cow<'static, str> {
        self.transform(byte).name
    }

    pub fn val_exists(&self, byte: u8) -> bool {
        self.entries.contains_key(&byte)
    }

    /// Overlays `entries` on top of the existing table without clearing it.
    pub fn merge(&mut self, entries: impl IntoIterator<Item = (u8, ValueDescriptor)>) {
        for (byte, descriptor) in entries {
            self.entries.insert(byte, descriptor);
        }
    }

    /// Stable ascending snapshot for presentation layers.
    pub fn to_array(&self) -> Vec<ValueTag> {
        self.entries.keys().map(|&byte| self.transform(byte)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The per-family value tables a board adapter carries.
#[derive(Debug, Clone, Default)]
pub struct ValueMaps {
    pub circuit_functions: ValueMap,
    pub heat_modes: ValueMap,
    pub heat_sources: ValueMap,
    pub pump_types: ValueMap,
    pub light_themes: ValueMap,
    pub schedule_days: ValueMap,
    pub virtual_circuits: ValueMap,
}

/// Recomputes the heat mode table from the installed heater mix.
///
/// Pure by construction: the adapter swaps the result in atomically instead of
/// editing the live table, so readers never observe a half-updated mix.
pub fn derive_heat_modes(heaters: &[crate::model::Heater]) -> ValueMap {
    let mut map = ValueMap::new([
        (0, ValueDescriptor::new("off", "Off")),
        (1, ValueDescriptor::new("heater", "Heater")),
    ]);
    let has_solar = heaters.iter().any(|h| h.heater_type == HeaterType::Solar);
    let has_heatpump = heaters.iter().any(|h| h.heater_type == HeaterType::HeatPump);
    if has_solar {
        map.merge([
            (2, ValueDescriptor::new("solarpref", "Solar Preferred")),
            (3, ValueDescriptor::new("solar", "Solar Only")),
        ]);
    }
    if has_heatpump {
        map.merge([
            (2, ValueDescriptor::new("heatpumppref", "Heat Pump Preferred")),
            (3, ValueDescriptor::new("heatpump", "Heat Pump Only")),
        ]);
    }
    map
}

/// One bound of an equipment id range: a literal, or computed from live equipment
/// counts on every resolution so count changes are observed without re-registration.
#[derive(Clone, Copy)]
pub enum Bound {
    Fixed(u8),
    Dynamic(fn(&EquipmentModel) -> u8),
}

impl std::fmt::Debug for Bound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bound::Fixed(v) => f.debug_tuple("Fixed").field(v).finish(),
            Bound::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl Bound {
    fn resolve(&self, model: &EquipmentModel) -> u8 {
        match self {
            Bound::Fixed(v) => *v,
            Bound::Dynamic(f) => f(model),
        }
    }
}

/// Start/end of an equipment-id address space.
#[derive(Debug, Clone, Copy)]
pub struct EquipmentIdRange {
    start: Bound,
    end: Bound,
}

impl EquipmentIdRange {
    pub fn new(start: Bound, end: Bound) -> Self {
        Self { start, end }
    }

    pub fn fixed(start: u8, end: u8) -> Self {
        Self { start: Bound::Fixed(start), end: Bound::Fixed(end) }
    }

    pub fn start(&self, model: &EquipmentModel) -> u8 {
        self.start.resolve(model)
    }

    pub fn end(&self, model: &EquipmentModel) -> u8 {
        self.end.resolve(model)
    }

    pub fn is_in_range(&self, model: &EquipmentModel, id: u8) -> bool {
        id >= self.start(model) && id <= self.end(model)
    }
}

/// Ids carved out of an otherwise valid range for the installed equipment module.
#[derive(Debug, Clone, Default)]
pub struct InvalidIdSet {
    ids: Vec<u8>,
}

impl InvalidIdSet {
    pub fn new(ids: &[u8]) -> Self {
        let mut set = Self::default();
        set.merge(ids);
        set
    }

    pub fn merge(&mut self, ids: &[u8]) {
        for &id in ids {
            if !self.ids.contains(&id) {
                self.ids.push(id);
            }
        }
        self.ids.sort_unstable();
    }

    pub fn remove(&mut self, id: u8) {
        self.ids.retain(|&i| i != id);
    }

    pub fn is_valid(&self, id: u8) -> bool {
        !self.ids.contains(&id)
    }
}

/// The id address spaces of one controller family.
#[derive(Debug, Clone)]
pub struct EquipmentIds {
    pub circuits: EquipmentIdRange,
    pub features: EquipmentIdRange,
    pub pumps: EquipmentIdRange,
    pub circuit_groups: EquipmentIdRange,
    pub virtual_circuits: EquipmentIdRange,
    pub schedules: EquipmentIdRange,
    pub invalid_ids: InvalidIdSet,
}

impl EquipmentIds {
    /// An id addressable as a circuit or feature on this family, minus carve-outs.
    pub fn is_valid_circuit(&self, model: &EquipmentModel, id: u8) -> bool {
        (self.circuits.is_in_range(model, id)
            || self.features.is_in_range(model, id)
            || self.circuit_groups.is_in_range(model, id))
            && self.invalid_ids.is_valid(id)
    }
}
