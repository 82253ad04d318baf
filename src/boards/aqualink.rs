use crate::boards::{BoardDialect, CircuitCommand, ControllerFamily, check_setpoint};
use crate::config::{ConfigPlanner, ConfigRequest};
use crate::error::EquipmentError;
use crate::model::{Category, Chlorinator, ConfigVersion, EquipmentModel, Pump, Schedule};
use crate::protocol::{Frame, Outbound};
use crate::valuemap::{EquipmentIdRange, EquipmentIds, InvalidIdSet, ValueDescriptor, ValueMap, ValueMaps};

/// This panel acknowledges nothing: commands and polls are fire-and-forget, and
/// model state is applied optimistically once the frame is out.
const CONFIG_POLL_BASE: u8 = 0xC0;

const CIRCUIT_COMMAND: u8 = 17;
const HEAT_COMMAND: u8 = 18;
const PUMP_COMMAND: u8 = 20;
const CHLORINATOR_COMMAND: u8 = 21;
const SCHEDULE_COMMAND: u8 = 22;
const LIGHT_COMMAND: u8 = 23;

const STATUS_BROADCAST: u8 = 2;

pub struct AquaLinkDialect {
    ids: EquipmentIds,
    maps: ValueMaps,
}

impl AquaLinkDialect {
    pub fn new() -> Self {
        let ids = EquipmentIds {
            circuits: EquipmentIdRange::fixed(1, 40),
            features: EquipmentIdRange::fixed(41, 50),
            pumps: EquipmentIdRange::fixed(1, 4),
            circuit_groups: EquipmentIdRange::fixed(1, 0),
            virtual_circuits: EquipmentIdRange::fixed(1, 0),
            schedules: EquipmentIdRange::fixed(1, 14),
            invalid_ids: InvalidIdSet::default(),
        };
        Self { ids, maps: value_maps() }
    }
}

impl Default for AquaLinkDialect {
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
            (7, ValueDescriptor::new("light", "Light").light()),
        ]),
        heat_modes: ValueMap::new([
            (0, ValueDescriptor::new("off", "Off")),
            (1, ValueDescriptor::new("heater", "Heater")),
        ]),
        heat_sources: ValueMap::new([
            (0, ValueDescriptor::new("off", "No Heater")),
            (3, ValueDescriptor::new("heater", "Heater")),
        ]),
        pump_types: ValueMap::new([
            (0, ValueDescriptor::new("none", "No Pump")),
            (1, ValueDescriptor::new("ss", "Single Speed")),
            (3, ValueDescriptor::new("vs", "Variable Speed")),
        ]),
        light_themes: ValueMap::new([
            (0, ValueDescriptor::new("white", "White")),
            (1, ValueDescriptor::new("green", "Green")),
            (2, ValueDescriptor::new("blue", "Blue")),
            (3, ValueDescriptor::new("red", "Red")),
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
        virtual_circuits: ValueMap::default(),
    }
}

impl ConfigPlanner for AquaLinkDialect {
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
                Category::Schedules => {
                    (self.ids.schedules.start(model)..=self.ids.schedules.end(model)).collect()
                }
                Category::CircuitGroups => continue,
                _ => vec![0],
            };
            requests.push(ConfigRequest::new(category, version, items));
        }
        requests
    }

    fn poll_message(&self, category: Category, item: u8) -> Outbound {
        // No matcher: the poll resolves as soon as it is on the wire and the item
        // counts as acquired. Whatever the panel volunteers later arrives as
        // unsolicited frames.
        Outbound::new(CONFIG_POLL_BASE | category as u8, vec![item])
    }

    fn classify_ack(&self, _frame: &Frame) -> Option<(Category, u8)> {
        None
    }
}

impl BoardDialect for AquaLinkDialect {
    fn family(&self) -> ControllerFamily {
        ControllerFamily::Aqualink
    }

    fn equipment_ids(&self) -> &EquipmentIds {
        &self.ids
    }

    fn value_maps(&self) -> &ValueMaps {
        &self.maps
    }

    fn applies_on_ack(&self) -> bool {
        false
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
            outbound: Some(Outbound::new(CIRCUIT_COMMAND, vec![id, on as u8])),
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
        Ok(Some(Outbound::new(HEAT_COMMAND, vec![target.id, setpoint])))
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
        Ok(Some(Outbound::new(HEAT_COMMAND, vec![target.id, 0, mode])))
    }

    fn build_pump(
        &self,
        _model: &EquipmentModel,
        pump: &Pump,
    ) -> Result<Option<Outbound>, EquipmentError> {
        let speed = pump.speed.unwrap_or(0);
        Ok(Some(Outbound::new(
            PUMP_COMMAND,
            vec![pump.id, pump.pump_type, (speed >> 8) as u8, (speed & 0xff) as u8],
        )))
    }

    fn build_chlorinator(
        &self,
        _model: &EquipmentModel,
        chlorinator: &Chlorinator,
    ) -> Result<Option<Outbound>, EquipmentError> {
        Ok(Some(Outbound::new(
            CHLORINATOR_COMMAND,
            vec![chlorinator.id, chlorinator.pool_setpoint, chlorinator.spa_setpoint],
        )))
    }

    fn build_schedule(
        &self,
        _model: &EquipmentModel,
        schedule: &Schedule,
    ) -> Result<Option<Outbound>, EquipmentError> {
        Ok(Some(Outbound::new(
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
        Ok(Some(Outbound::new(LIGHT_COMMAND, vec![circuit, theme])))
    }

    fn decode_version_frame(&self, _frame: &Frame) -> Option<ConfigVersion> {
        None
    }

    fn apply_status_frame(&self, model: &mut EquipmentModel, frame: &Frame) {
        if frame.action != STATUS_BROADCAST || frame.payload.len() < 4 {
            return;
        }
        for id in 1u8..=16 {
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
    use crate::boards::{BoardAdapter, SystemContext};
    use crate::bus::testing::MockTransport;
    use crate::bus::{Args, Bus};
    use crate::config::{QueueState, Tuning};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use strum::IntoEnumIterator as _;

    #[test]
    fn commands_carry_no_response_matcher() {
        let dialect = AquaLinkDialect::new();
        let model = EquipmentModel::default();
        let command = dialect.build_circuit_state(&model, 3, true).unwrap();
        assert!(command.outbound.unwrap().response.is_none());
        let poll = dialect.poll_message(Category::Options, 0);
        assert!(poll.response.is_none());
        assert_eq!(poll.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_panel_still_completes_a_fetch() {
        // Nothing ever answers, yet the optimistic drain attains every category.
        let transport = MockTransport::dead();
        let (bus, frames) = Bus::spawn(transport, Args::default());
        let model = Arc::new(Mutex::new(EquipmentModel::default()));
        let ctx = SystemContext { model: Arc::clone(&model), bus: bus.handle() };
        let tuning =
            Tuning { settle: Duration::from_millis(10), stale_after: Duration::from_secs(600) };
        let adapter = BoardAdapter::attach(ControllerFamily::Aqualink, ctx, tuning, frames);
        adapter.request_configuration();
        let mut progress = adapter.progress();
        loop {
            progress.changed().await.unwrap();
            if progress.borrow().state == QueueState::Idle {
                break;
            }
        }
        let model = model.lock().unwrap();
        for category in Category::iter() {
            assert_eq!(model.versions.get(category), 1, "{category}");
        }
    }
}
