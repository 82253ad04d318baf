use crate::boards::{BoardDialect, CircuitCommand, ControllerFamily, check_setpoint};
use crate::config::{ConfigPlanner, ConfigRequest};
use crate::error::EquipmentError;
use crate::model::{Category, Chlorinator, ConfigVersion, EquipmentModel, Pump, Schedule};
use crate::protocol::{Frame, Outbound, ResponseMatch};
use crate::valuemap::{
    Bound, EquipmentIdRange, EquipmentIds, InvalidIdSet, ValueDescriptor, ValueMap, ValueMaps,
};
use strum::IntoEnumIterator as _;

/// Configuration poll: `[category, item]`, answered by action 30 with the same
/// two-byte prefix followed by the item's data.
const CONFIG_POLL: u8 = 222;
const CONFIG_ACK: u8 = 30;
const CONFIG_RETRIES: u8 = 5;

/// Command pages ride action 168 and are confirmed by the standard ack.
const COMMAND: u8 = 168;
const STANDARD_ACK: u8 = 1;
const COMMAND_RETRIES: u8 = 3;

/// Version counters are broadcast as 11 little-endian u32s, one per category.
const VERSION_BROADCAST: u8 = 164;
const STATUS_BROADCAST: u8 = 2;

pub struct IntelliCenterDialect {
    ids: EquipmentIds,
    maps: ValueMaps,
}

impl IntelliCenterDialect {
    pub fn new() -> Self {
        let ids = EquipmentIds {
            circuits: EquipmentIdRange::fixed(1, 40),
            features: EquipmentIdRange::fixed(129, 168),
            pumps: EquipmentIdRange::fixed(1, 16),
            // Groups sit at 193 and up; only the installed count is addressable.
            circuit_groups: EquipmentIdRange::new(
                Bound::Fixed(193),
                Bound::Dynamic(|model| {
                    192u8.saturating_add(model.limits.max_circuit_groups).min(204)
                }),
            ),
            virtual_circuits: EquipmentIdRange::fixed(237, 246),
            schedules: EquipmentIdRange::fixed(1, 100),
            invalid_ids: InvalidIdSet::default(),
        };
        Self { ids, maps: value_maps() }
    }

    fn command(&self, page: u8, payload: &[u8]) -> Outbound {
        let mut body = vec![page];
        body.extend_from_slice(payload);
        Outbound::new(COMMAND, body)
            .with_retries(COMMAND_RETRIES)
            .with_response(ResponseMatch::action(STANDARD_ACK).with_prefix(&[COMMAND]))
    }
}

impl Default for IntelliCenterDialect {
    fn default() -> Self {
        Self::new()
    }
}

pub fn value_maps() -> ValueMaps {
    ValueMaps {
        circuit_functions: ValueMap::new([
            (0, ValueDescriptor::new("generic", "Generic")),
            (1, ValueDescriptor::new("spa", "Spa")),
            (2, ValueDescriptor::new("pool", "Pool")),
            (5, ValueDescriptor::new("mastercleaner", "Master Cleaner")),
            (7, ValueDescriptor::new("light", "Light").light()),
            (8, ValueDescriptor::new("colorwheel", "Color Wheel").light()),
            (9, ValueDescriptor::new("dimmer", "Dimmer").light()),
            (16, ValueDescriptor::new("intellibrite", "IntelliBrite").light()),
        ]),
        heat_modes: ValueMap::new([
            (0, ValueDescriptor::new("off", "Off")),
            (1, ValueDescriptor::new("heater", "Heater")),
        ]),
        heat_sources: ValueMap::new([
            (0, ValueDescriptor::new("off", "No Heater")),
            (3, ValueDescriptor::new("heater", "Heater")),
            (5, ValueDescriptor::new("solar", "Solar Only")),
            (21, ValueDescriptor::new("solarpref", "Solar Preferred")),
        ]),
        pump_types: ValueMap::new([
            (0, ValueDescriptor::new("none", "No Pump")),
            (1, ValueDescriptor::new("ss", "Single Speed")),
            (2, ValueDescriptor::new("ds", "Two Speed")),
            (3, ValueDescriptor::new("vs", "Intelliflo VS")),
            (4, ValueDescriptor::new("vsf", "Intelliflo VSF")),
            (5, ValueDescriptor::new("vf", "Intelliflo VF")),
        ]),
        light_themes: ValueMap::new([
            (0, ValueDescriptor::new("white", "White")),
            (1, ValueDescriptor::new("green", "Green")),
            (2, ValueDescriptor::new("blue", "Blue")),
            (3, ValueDescriptor::new("magenta", "Magenta")),
            (4, ValueDescriptor::new("red", "Red")),
            (5, ValueDescriptor::new("party", "Party")),
            (6, ValueDescriptor::new("romance", "Romance")),
            (7, ValueDescriptor::new("caribbean", "Caribbean")),
            (8, ValueDescriptor::new("american", "American")),
            (9, ValueDescriptor::new("sunset", "Sunset")),
            (10, ValueDescriptor::new("royal", "Royal")),
        ]),
        schedule_days: ValueMap::new([
            (1, ValueDescriptor::new("sun", "Sunday")),
            (2, ValueDescriptor::new("mon", "Monday")),
            (4, ValueDescriptor::new("tue", "Tuesday")),
            (8, ValueDescriptor::new("wed", "Wednesday")),
            (16, ValueDescriptor::new("thu", "Thursday")),
            (32, ValueDescriptor::new("fri", "Friday")),
            (64, ValueDescriptor::new("sat", "Saturday")),
        ]),
        virtual_circuits: ValueMap::new([
            (237, ValueDescriptor::new("poolHeater", "Pool Heater")),
            (238, ValueDescriptor::new("spaHeater", "Spa Heater")),
            (239, ValueDescriptor::new("freeze", "Freeze Protection")),
            (240, ValueDescriptor::new("poolSpa", "Pool/Spa")),
            (241, ValueDescriptor::new("solarHeat", "Solar Heat")),
            (242, ValueDescriptor::new("heater", "Any Heater")),
        ]),
    }
}

fn items_for(category: Category, model: &EquipmentModel) -> Vec<u8> {
    match category {
        Category::Equipment | Category::Heaters => (0..=3).collect(),
        Category::Options | Category::Features | Category::Valves | Category::CircuitGroups => {
            vec![0, 1]
        }
        Category::Circuits => {
            // Circuits come back eight to a page.
            let pages = model.limits.max_circuits.max(1).div_ceil(8);
            (0..pages).collect()
        }
        Category::Schedules => {
            let pages = model.limits.max_schedules.max(1).div_ceil(5);
            (0..pages).collect()
        }
        Category::Chlorinators => vec![0],
        Category::General => vec![0, 1, 2],
        // Count first, then one item per installed pump.
        Category::Pumps => vec![0],
    }
}

impl ConfigPlanner for IntelliCenterDialect {
    fn plan(
        &self,
        local: &ConfigVersion,
        remote: &ConfigVersion,
        model: &EquipmentModel,
    ) -> Vec<ConfigRequest> {
        let mut requests = Vec::new();
        for category in local.dirty_categories(remote) {
            let version = remote.get(category);
            let items = items_for(category, model);
            if items.is_empty() {
                continue;
            }
            let mut request = ConfigRequest::new(category, version, items);
            if category == Category::Pumps {
                request = request.on_complete(|request, model| {
                    let count = model.pumps.len().min(u8::MAX as usize) as u8;
                    if count > 0 && request.acquired == [0] {
                        request.fill_range(1, count);
                    }
                });
            }
            requests.push(request);
        }
        requests
    }

    fn poll_message(&self, category: Category, item: u8) -> Outbound {
        Outbound::new(CONFIG_POLL, vec![category as u8, item])
            .with_retries(CONFIG_RETRIES)
            .with_response(
                ResponseMatch::action(CONFIG_ACK).with_prefix(&[category as u8, item]),
            )
    }

    fn classify_ack(&self, frame: &Frame) -> Option<(Category, u8)> {
        if frame.action != CONFIG_ACK {
            return None;
        }
        let category = Category::from_byte(frame.payload_byte(0)?)?;
        Some((category, frame.payload_byte(1)?))
    }

    fn apply(&self, model: &mut EquipmentModel, category: Category, frame: &Frame) {
        match category {
            // The pump count page: byte 2 carries how many pumps are installed.
            Category::Pumps if frame.payload_byte(1) == Some(0) => {
                let Some(count) = frame.payload_byte(2) else { return };
                for id in 1..=count {
                    if model.pump(id).is_none() {
                        model.pumps.push(Pump { id, ..Pump::default() });
                    }
                }
                model.pumps.sort_by_key(|p| p.id);
            }
            Category::Circuits => {
                // One page holds up to eight [id, function] pairs.
                for pair in frame.payload.get(2..).unwrap_or(&[]).chunks_exact(2) {
                    if pair[0] != 0 {
                        model.circuit_entry(pair[0]).function = pair[1];
                    }
                }
            }
            _ => {}
        }
    }
}

impl BoardDialect for IntelliCenterDialect {
    fn family(&self) -> ControllerFamily {
        ControllerFamily::Intellicenter
    }

    fn equipment_ids(&self) -> &EquipmentIds {
        &self.ids
    }

    fn value_maps(&self) -> &ValueMaps {
        &self.maps
    }

    fn applies_on_ack(&self) -> bool {
        true
    }

    fn build_circuit_state(
        &self,
        model: &EquipmentModel,
        id: u8,
        on: bool,
    ) -> Result<CircuitCommand, EquipmentError> {
        if !self.ids.is_valid_circuit(model, id) {
            return Err(EquipmentError::InvalidId { id, equipment: "circuit" });
        }
        Ok(CircuitCommand {
            outbound: Some(self.command(1, &[0, id, on as u8])),
            id,
            on,
        })
    }

    fn build_heat_setpoint(
        &self,
        model: &EquipmentModel,
        body: u8,
        setpoint: u8,
    ) -> Result<Option<Outbound>, EquipmentError> {
        let target = model
            .body(body)
            .ok_or(EquipmentError::NotFound { id: body, equipment: "body" })?;
        check_setpoint(model.temp_units, body, setpoint)?;
        Ok(Some(self.command(2, &[target.id, setpoint])))
    }

    fn build_heat_mode(
        &self,
        model: &EquipmentModel,
        body: u8,
        mode: u8,
    ) -> Result<Option<Outbound>, EquipmentError> {
        let target = model
            .body(body)
            .ok_or(EquipmentError::NotFound { id: body, equipment: "body" })?;
        Ok(Some(self.command(3, &[target.id, mode])))
    }

    fn build_pump(
        &self,
        _model: &EquipmentModel,
        pump: &Pump,
    ) -> Result<Option<Outbound>, EquipmentError> {
        let speed = pump.speed.unwrap_or(0);
        Ok(Some(self.command(
            4,
            &[pump.id, pump.pump_type, (speed >> 8) as u8, (speed & 0xff) as u8],
        )))
    }

    fn build_chlorinator(
        &self,
        _model: &EquipmentModel,
        chlorinator: &Chlorinator,
    ) -> Result<Option<Outbound>, EquipmentError> {
        Ok(Some(self.command(
            5,
            &[
                chlorinator.id,
                chlorinator.pool_setpoint,
                chlorinator.spa_setpoint,
                chlorinator.super_chlorinate as u8,
            ],
        )))
    }

    fn build_schedule(
        &self,
        _model: &EquipmentModel,
        schedule: &Schedule,
    ) -> Result<Option<Outbound>, EquipmentError> {
        Ok(Some(self.command(
            6,
            &[
                schedule.id,
                schedule.circuit,
                (schedule.start_time >> 8) as u8,
                (schedule.start_time & 0xff) as u8,
                (schedule.end_time >> 8) as u8,
                (schedule.end_time & 0xff) as u8,
                schedule.days,
            ],
        )))
    }

    fn build_light_theme(
        &self,
        _model: &EquipmentModel,
        circuit: u8,
        theme: u8,
    ) -> Result<Option<Outbound>, EquipmentError> {
        Ok(Some(self.command(7, &[circuit, theme])))
    }

    fn decode_version_frame(&self, frame: &Frame) -> Option<ConfigVersion> {
        if frame.action != VERSION_BROADCAST {
            return None;
        }
        let mut versions = ConfigVersion::default();
        let mut chunks = frame.payload.chunks_exact(4);
        for category in Category::iter() {
            let chunk = chunks.next()?;
            versions.set(
                category,
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            );
        }
        Some(versions)
    }

    fn apply_status_frame(&self, model: &mut EquipmentModel, frame: &Frame) {
        if frame.action != STATUS_BROADCAST || frame.payload.len() < 6 {
            return;
        }
        // Circuit on/off bitmask, circuits 1..=32, starting at payload byte 2.
        for id in 1u8..=32 {
            let byte = 2 + usize::from(id - 1) / 8;
            let Some(&bits) = frame.payload.get(byte) else { break };
            let on = bits & (1 << ((id - 1) % 8)) != 0;
            if model.circuit(id).is_some() || on {
                model.circuit_entry(id).is_on = on;
            }
        }
    }
}

/// Encodes a version vector the way the panel broadcasts it.
pub fn encode_version_frame(versions: &ConfigVersion) -> Frame {
    let mut payload = Vec::with_capacity(44);
    for category in Category::iter() {
        payload.extend_from_slice(&versions.get(category).to_le_bytes());
    }
    Frame::new(
        crate::protocol::OCP_ADDRESS,
        crate::protocol::BROADCAST_ADDRESS,
        VERSION_BROADCAST,
        payload,
    )
}
