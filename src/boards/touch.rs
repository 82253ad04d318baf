use crate::boards::{BoardDialect, CircuitCommand, ControllerFamily, check_setpoint};
use crate::config::{ConfigPlanner, ConfigRequest};
use crate::error::EquipmentError;
use crate::model::{Category, Chlorinator, ConfigVersion, EquipmentModel, Pump, Schedule};
use crate::protocol::{Frame, OCP_ADDRESS, Outbound, ResponseMatch};
use crate::valuemap::{
    Bound, EquipmentIdRange, EquipmentIds, InvalidIdSet, ValueDescriptor, ValueMap, ValueMaps,
};

/// Configuration polls carry the category in the low action bits and the item in the
/// payload; the panel answers with `0x80 | category`, a code space disjoint from the
/// low-numbered broadcast actions, so a status broadcast can never satisfy a poll's
/// response matcher.
const CONFIG_POLL_BASE: u8 = 0xC0;
const CONFIG_REPLY_BASE: u8 = 0x80;
const CONFIG_RETRIES: u8 = 3;

const CIRCUIT_COMMAND: u8 = 134;
const HEAT_COMMAND: u8 = 136;
const SCHEDULE_COMMAND: u8 = 145;
const CHLORINATOR_COMMAND: u8 = 153;
const PUMP_COMMAND: u8 = 155;
const LIGHT_COMMAND: u8 = 96;
const STANDARD_ACK: u8 = 1;
const COMMAND_RETRIES: u8 = 3;

const STATUS_BROADCAST: u8 = 2;

/// Well-known body circuits on the Touch lines.
const SPA_CIRCUIT: u8 = 1;
const POOL_CIRCUIT: u8 = 6;

/// Shared dialect for the Touch product lines. The three panels speak the same
/// protocol and differ only in their id address spaces and capacities.
pub struct TouchDialect {
    family: ControllerFamily,
    ids: EquipmentIds,
    maps: ValueMaps,
}

impl TouchDialect {
    pub fn easytouch() -> Self {
        Self {
            family: ControllerFamily::Easytouch,
            ids: EquipmentIds {
                circuits: shared_aware_circuits(10),
                features: EquipmentIdRange::fixed(11, 20),
                pumps: EquipmentIdRange::fixed(1, 2),
                circuit_groups: installed_circuit_groups(),
                virtual_circuits: EquipmentIdRange::fixed(128, 136),
                schedules: EquipmentIdRange::fixed(1, 12),
                // The 4-circuit models carve further ids out, but that depends on
                // the detected panel model rather than the family.
                invalid_ids: InvalidIdSet::default(),
            },
            maps: value_maps(),
        }
    }

    pub fn intellitouch() -> Self {
        Self {
            family: ControllerFamily::Intellitouch,
            ids: EquipmentIds {
                circuits: shared_aware_circuits(40),
                features: EquipmentIdRange::fixed(41, 50),
                pumps: EquipmentIdRange::fixed(1, 8),
                circuit_groups: installed_circuit_groups(),
                virtual_circuits: EquipmentIdRange::fixed(154, 162),
                schedules: EquipmentIdRange::fixed(1, 99),
                // 16..=18 are reserved on every IntelliTouch model.
                invalid_ids: InvalidIdSet::new(&[16, 17, 18]),
            },
            maps: value_maps(),
        }
    }

    pub fn suntouch() -> Self {
        Self {
            family: ControllerFamily::Suntouch,
            ids: EquipmentIds {
                circuits: shared_aware_circuits(6),
                features: EquipmentIdRange::fixed(7, 10),
                pumps: EquipmentIdRange::fixed(1, 1),
                // No circuit groups on this panel.
                circuit_groups: EquipmentIdRange::fixed(1, 0),
                virtual_circuits: EquipmentIdRange::fixed(128, 136),
                schedules: EquipmentIdRange::fixed(1, 6),
                invalid_ids: InvalidIdSet::default(),
            },
            maps: value_maps(),
        }
    }

    fn command(&self, action: u8, payload: Vec<u8>) -> Outbound {
        Outbound::new(action, payload)
            .with_retries(COMMAND_RETRIES)
            .with_response(ResponseMatch::action(STANDARD_ACK).with_prefix(&[action]))
    }

    /// The combined two-body heat frame. Both setpoints and both modes travel in
    /// every frame, so the current model values ride along with the one change.
    fn heat_frame(
        &self,
        model: &EquipmentModel,
        body: u8,
        setpoint: Option<u8>,
        mode: Option<u8>,
    ) -> Result<Outbound, EquipmentError> {
        let target = model
            .body(body)
            .ok_or(EquipmentError::NotFound { id: body, equipment: "body" })?;
        let pool = model.body(1).cloned().unwrap_or_default();
        let spa = model.body(2).cloned().unwrap_or_default();
        let pick = |id: u8, current: u8, new: Option<u8>| {
            if target.id == id { new.unwrap_or(current) } else { current }
        };
        let temp1 = pick(1, pool.setpoint, setpoint);
        let temp2 = pick(2, spa.setpoint, setpoint);
        let mode1 = pick(1, pool.heat_mode, mode);
        let mode2 = pick(2, spa.heat_mode, mode);
        let cool = target.cool_setpoint.unwrap_or(0);
        Ok(self.command(HEAT_COMMAND, vec![temp1, temp2, mode2 << 2 | mode1, cool]))
    }
}

/// Circuit ids start at the spa circuit on shared-body panels and just above it
/// otherwise, where id 1 is not addressable.
fn shared_aware_circuits(end: u8) -> EquipmentIdRange {
    EquipmentIdRange::new(
        Bound::Dynamic(|model| if model.limits.shared { SPA_CIRCUIT } else { SPA_CIRCUIT + 1 }),
        Bound::Fixed(end),
    )
}

/// Circuit group ids sit at 192 and up, but only the installed count is addressable;
/// a panel without groups gets an empty range.
pub(crate) fn installed_circuit_groups() -> EquipmentIdRange {
    EquipmentIdRange::new(
        Bound::Fixed(192),
        Bound::Dynamic(|model| 191u8.saturating_add(model.limits.max_circuit_groups).min(201)),
    )
}

pub fn value_maps() -> ValueMaps {
    ValueMaps {
        circuit_functions: ValueMap::new([
            (0, ValueDescriptor::new("generic", "Generic")),
            (1, ValueDescriptor::new("spa", "Spa")),
            (2, ValueDescriptor::new("pool", "Pool")),
            (5, ValueDescriptor::new("mastercleaner", "Master Cleaner")),
            (7, ValueDescriptor::new("light", "Light").light()),
            (9, ValueDescriptor::new("samlight", "SAm Light").light()),
            (10, ValueDescriptor::new("sallight", "SAL Light").light()),
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
            (1, ValueDescriptor::new("vf", "Intelliflo VF")),
            (64, ValueDescriptor::new("vsf", "Intelliflo VSF")),
            (128, ValueDescriptor::new("vs", "Intelliflo VS")),
        ]),
        light_themes: ValueMap::new([
            (0, ValueDescriptor::new("white", "White")),
            (2, ValueDescriptor::new("lightgreen", "Light Green")),
            (4, ValueDescriptor::new("green", "Green")),
            (6, ValueDescriptor::new("cyan", "Cyan")),
            (8, ValueDescriptor::new("blue", "Blue")),
            (10, ValueDescriptor::new("lavender", "Lavender")),
            (12, ValueDescriptor::new("magenta", "Magenta")),
            (128, ValueDescriptor::new("colorsync", "Color Sync")),
            (144, ValueDescriptor::new("colorswim", "Color Swim")),
            (160, ValueDescriptor::new("colorset", "Color Set")),
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
            (128, ValueDescriptor::new("solar", "Solar")),
            (129, ValueDescriptor::new("heater", "Either Heater")),
            (130, ValueDescriptor::new("poolHeater", "Pool Heater")),
            (131, ValueDescriptor::new("spaHeater", "Spa Heater")),
            (132, ValueDescriptor::new("freeze", "Freeze Protection")),
            (133, ValueDescriptor::new("poolSpa", "Pool/Spa")),
        ]),
    }
}

impl ConfigPlanner for TouchDialect {
    fn plan(
        &self,
        local: &ConfigVersion,
        remote: &ConfigVersion,
        model: &EquipmentModel,
    ) -> Vec<ConfigRequest> {
        let mut requests = Vec::new();
        for category in local.dirty_categories(remote) {
            let version = remote.get(category);
            let items: Vec<u8> = match category {
                Category::Circuits => {
                    (self.ids.circuits.start(model)..=self.ids.circuits.end(model)).collect()
                }
                Category::Features => {
                    (self.ids.features.start(model)..=self.ids.features.end(model)).collect()
                }
                Category::Pumps => {
                    (self.ids.pumps.start(model)..=self.ids.pumps.end(model)).collect()
                }
                Category::Schedules => {
                    (self.ids.schedules.start(model)..=self.ids.schedules.end(model)).collect()
                }
                Category::CircuitGroups => (self.ids.circuit_groups.start(model)
                    ..=self.ids.circuit_groups.end(model))
                    .collect(),
                _ => vec![0],
            };
            if items.is_empty() {
                continue;
            }
            requests.push(ConfigRequest::new(category, version, items));
        }
        requests
    }

    fn poll_message(&self, category: Category, item: u8) -> Outbound {
        Outbound::new(CONFIG_POLL_BASE | category as u8, vec![item])
            .with_retries(CONFIG_RETRIES)
            .with_response(
                ResponseMatch::action(CONFIG_REPLY_BASE | category as u8)
                    .with_prefix(&[item])
                    .with_source(OCP_ADDRESS),
            )
    }

    fn classify_ack(&self, frame: &Frame) -> Option<(Category, u8)> {
        if frame.action & 0xC0 != CONFIG_REPLY_BASE {
            return None;
        }
        let category = Category::from_byte(frame.action & 0x3F)?;
        Some((category, frame.payload_byte(0)?))
    }

    fn apply(&self, model: &mut EquipmentModel, category: Category, frame: &Frame) {
        // Circuit replies carry [id, function, ...name bytes].
        if category == Category::Circuits {
            if let (Some(id), Some(function)) = (frame.payload_byte(0), frame.payload_byte(1)) {
                if id != 0 {
                    model.circuit_entry(id).function = function;
                }
            }
        }
    }
}

impl BoardDialect for TouchDialect {
    fn family(&self) -> ControllerFamily {
        self.family
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
        // Shared-body interlock: the panel cannot run the pool while the spa holds
        // the valves. Asking for pool-on while the spa runs means "give me the pool
        // body back", which is a spa-off command on the wire.
        let (id, on) = if model.limits.shared
            && id == POOL_CIRCUIT
            && on
            && model.circuit(SPA_CIRCUIT).is_some_and(|c| c.is_on)
        {
            (SPA_CIRCUIT, false)
        } else {
            (id, on)
        };
        Ok(CircuitCommand {
            outbound: Some(self.command(CIRCUIT_COMMAND, vec![id, on as u8])),
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
        check_setpoint(model.temp_units, body, setpoint)?;
        Ok(Some(self.heat_frame(model, body, Some(setpoint), None)?))
    }

    fn build_heat_mode(
        &self,
        model: &EquipmentModel,
        body: u8,
        mode: u8,
    ) -> Result<Option<Outbound>, EquipmentError> {
        Ok(Some(self.heat_frame(model, body, None, Some(mode))?))
    }

    fn build_pump(
        &self,
        _model: &EquipmentModel,
        pump: &Pump,
    ) -> Result<Option<Outbound>, EquipmentError> {
        let speed = pump.speed.unwrap_or(0);
        Ok(Some(self.command(
            PUMP_COMMAND,
            vec![pump.id, pump.pump_type, (speed >> 8) as u8, (speed & 0xff) as u8],
        )))
    }

    fn build_chlorinator(
        &self,
        _model: &EquipmentModel,
        chlorinator: &Chlorinator,
    ) -> Result<Option<Outbound>, EquipmentError> {
        Ok(Some(self.command(
            CHLORINATOR_COMMAND,
            vec![
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
            SCHEDULE_COMMAND,
            vec![
                schedule.id,
                schedule.circuit,
                (schedule.start_time / 60) as u8,
                (schedule.start_time % 60) as u8,
                (schedule.end_time / 60) as u8,
                (schedule.end_time % 60) as u8,
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
        Ok(Some(self.command(LIGHT_COMMAND, vec![theme, circuit])))
    }

    fn decode_version_frame(&self, _frame: &Frame) -> Option<ConfigVersion> {
        // Touch panels never announce configuration counters; fetches are kicked
        // off explicitly and by the staleness watchdog.
        None
    }

    fn apply_status_frame(&self, model: &mut EquipmentModel, frame: &Frame) {
        if frame.action != STATUS_BROADCAST || frame.payload.len() < 5 {
            return;
        }
        // Circuits 1..=24 as a bitmask starting at payload byte 2.
        for id in 1u8..=24 {
            if !self.ids.invalid_ids.is_valid(id) {
                continue;
            }
            let byte = 2 + usize::from(id - 1) / 8;
            let Some(&bits) = frame.payload.get(byte) else { break };
            let on = bits & (1 << ((id - 1) % 8)) != 0;
            if model.circuit(id).is_some() || on {
                model.circuit_entry(id).is_on = on;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Body;

    fn shared_model() -> EquipmentModel {
        let mut model = EquipmentModel::default();
        model.limits.shared = true;
        model.limits.max_circuits = 10;
        model.bodies.push(Body { id: 1, setpoint: 82, heat_mode: 1, ..Body::default() });
        model.bodies.push(Body { id: 2, setpoint: 100, heat_mode: 0, ..Body::default() });
        model
    }

    #[test]
    fn pool_on_while_spa_runs_becomes_spa_off() {
        let dialect = TouchDialect::easytouch();
        let mut model = shared_model();
        model.circuit_entry(SPA_CIRCUIT).is_on = true;
        let command = dialect.build_circuit_state(&model, POOL_CIRCUIT, true).unwrap();
        assert_eq!(command.id, SPA_CIRCUIT);
        assert!(!command.on);
        let outbound = command.outbound.unwrap();
        assert_eq!(outbound.action, CIRCUIT_COMMAND);
        assert_eq!(outbound.payload, vec![SPA_CIRCUIT, 0]);
    }

    #[test]
    fn pool_on_with_spa_off_is_passed_through() {
        let dialect = TouchDialect::easytouch();
        let model = shared_model();
        let command = dialect.build_circuit_state(&model, POOL_CIRCUIT, true).unwrap();
        assert_eq!(command.id, POOL_CIRCUIT);
        assert!(command.on);
    }

    #[test]
    fn spa_circuit_is_unaddressable_on_single_body_panels() {
        let dialect = TouchDialect::easytouch();
        let mut model = shared_model();
        model.limits.shared = false;
        let error = dialect.build_circuit_state(&model, SPA_CIRCUIT, true).unwrap_err();
        assert!(matches!(error, EquipmentError::InvalidId { id: 1, equipment: "circuit" }));
        model.limits.shared = true;
        assert!(dialect.build_circuit_state(&model, SPA_CIRCUIT, true).is_ok());
    }

    #[test]
    fn setpoint_bounds_follow_the_unit_system() {
        let dialect = TouchDialect::easytouch();
        let mut model = shared_model();
        assert!(dialect.build_heat_setpoint(&model, 1, 104).is_ok());
        let error = dialect.build_heat_setpoint(&model, 1, 105).unwrap_err();
        assert!(matches!(error, EquipmentError::InvalidData { field: "setpoint", value: 105, .. }));
        assert!(dialect.build_heat_setpoint(&model, 1, 39).is_err());
        model.temp_units = crate::model::TempUnits::Celsius;
        assert!(dialect.build_heat_setpoint(&model, 1, 40).is_ok());
        assert!(dialect.build_heat_setpoint(&model, 1, 41).is_err());
    }

    #[test]
    fn heat_frame_packs_both_bodies() {
        let dialect = TouchDialect::easytouch();
        let model = shared_model();
        let outbound = dialect.build_heat_setpoint(&model, 2, 98).unwrap().unwrap();
        assert_eq!(outbound.action, HEAT_COMMAND);
        // Pool setpoint rides along unchanged; modes are packed into one byte.
        assert_eq!(outbound.payload, vec![82, 98, 0 << 2 | 1, 0]);
    }

    #[test]
    fn feature_ranges_differ_per_family() {
        let model = shared_model();
        let easy = TouchDialect::easytouch();
        assert!(easy.ids.features.is_in_range(&model, 11));
        assert!(!easy.ids.features.is_in_range(&model, 41));
        let intelli = TouchDialect::intellitouch();
        assert!(intelli.ids.features.is_in_range(&model, 41));
        let sun = TouchDialect::suntouch();
        assert!(sun.ids.features.is_in_range(&model, 7));
        assert!(!sun.ids.features.is_in_range(&model, 11));
        // No circuit groups on SunTouch at all.
        assert!(!sun.ids.circuit_groups.is_in_range(&model, 192));
    }

    #[test]
    fn poll_reply_classification_uses_the_action_byte() {
        let dialect = TouchDialect::intellitouch();
        let poll = dialect.poll_message(Category::Schedules, 4);
        assert_eq!(poll.action, CONFIG_POLL_BASE | Category::Schedules as u8);
        let reply = Frame::new(
            16,
            33,
            CONFIG_REPLY_BASE | Category::Schedules as u8,
            vec![4, 6, 8, 0],
        );
        assert!(poll.response.as_ref().unwrap().matches(&reply));
        assert_eq!(dialect.classify_ack(&reply), Some((Category::Schedules, 4)));
    }

    #[test]
    fn status_broadcast_never_satisfies_a_circuit_poll() {
        // Both ride the bus during a circuits drain; the reply code space keeps
        // them apart even when the broadcast's first byte equals the polled item.
        let dialect = TouchDialect::easytouch();
        let poll = dialect.poll_message(Category::Circuits, 3);
        let status = Frame::new(16, 15, STATUS_BROADCAST, vec![3, 0, 0x04, 0, 0]);
        assert!(!poll.response.as_ref().unwrap().matches(&status));
        assert_eq!(dialect.classify_ack(&status), None);
        let reply = Frame::new(16, 33, CONFIG_REPLY_BASE | Category::Circuits as u8, vec![3, 7]);
        assert!(poll.response.as_ref().unwrap().matches(&reply));
    }

    #[test]
    fn circuit_group_ids_follow_the_installed_count() {
        let dialect = TouchDialect::easytouch();
        let mut model = shared_model();
        assert!(!dialect.ids.circuit_groups.is_in_range(&model, 192));
        assert!(dialect.build_circuit_state(&model, 200, true).is_err());
        model.limits.max_circuit_groups = 2;
        assert!(dialect.ids.circuit_groups.is_in_range(&model, 192));
        assert!(dialect.ids.circuit_groups.is_in_range(&model, 193));
        assert!(!dialect.ids.circuit_groups.is_in_range(&model, 194));
        assert!(dialect.build_circuit_state(&model, 193, true).is_ok());
    }

    #[test]
    fn intellitouch_reserved_ids_are_carved_out() {
        let dialect = TouchDialect::intellitouch();
        let model = shared_model();
        assert!(dialect.ids.is_valid_circuit(&model, 15));
        for id in 16..=18 {
            assert!(!dialect.ids.is_valid_circuit(&model, id));
        }
        assert!(dialect.build_circuit_state(&model, 17, false).is_err());
        // Status bits for reserved ids never materialize circuits.
        let mut model = model;
        let frame = Frame::new(16, 15, STATUS_BROADCAST, vec![0, 0, 0, 0x80, 0]);
        dialect.apply_status_frame(&mut model, &frame);
        assert!(model.circuit(16).is_none());
    }

    #[test]
    fn plan_polls_every_circuit_id_in_range() {
        let dialect = TouchDialect::easytouch();
        let model = shared_model();
        let local = ConfigVersion::default();
        let remote = local.with(Category::Circuits, 1);
        let requests = dialect.plan(&local, &remote, &model);
        let circuits = requests.iter().find(|r| r.category == Category::Circuits).unwrap();
        assert_eq!(circuits.items, (1..=10).collect::<Vec<u8>>());
    }
}
