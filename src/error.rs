/// Failures surfaced by the upward command API.
///
/// Validation errors (`InvalidId`, `InvalidData`, `NotFound`) are returned before any
/// message is built and never reach the bus. `Timeout` means the retry budget for an
/// outbound command was exhausted.
#[derive(thiserror::Error, Debug)]
pub enum EquipmentError {
    #[error("invalid {equipment} id {id}")]
    InvalidId { id: u8, equipment: &'static str },
    #[error("invalid {field} for {equipment} {id}: {value}")]
    InvalidData { id: u8, equipment: &'static str, field: &'static str, value: i32 },
    #[error("{equipment} {id} does not exist")]
    NotFound { id: u8, equipment: &'static str },
    #[error("no response from the panel after {attempts} attempts")]
    Timeout { attempts: u8 },
    #[error("could not schedule the command on the bus")]
    Bus(#[source] crate::bus::Error),
}
