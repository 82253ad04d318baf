pub mod valuemaps {
    use std::path::PathBuf;

    use crate::boards::{ControllerFamily, dialect_for};
    use crate::valuemap::ValueMaps;

    #[derive(clap::ValueEnum, Clone, Debug)]
    pub enum Format {
        Table,
        Json,
        Csv,
    }

    /// Output the byte code tables of a controller family.
    #[derive(clap::Parser)]
    pub struct Args {
        #[arg(value_enum)]
        family: ControllerFamily,
        #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
        format: Format,
        filter: Option<String>,
        #[arg(long, short = 'o')]
        file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not open the specified output file at {1:?}")]
        OpenOutputFile(#[source] std::io::Error, PathBuf),
        #[error("could not write data to the output file at {1:?}")]
        WriteFile(#[source] std::io::Error, PathBuf),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
        #[error("could not serialize value maps to JSON")]
        SerializeJson(#[source] serde_json::Error),
        #[error("could not serialize value maps to CSV")]
        SerializeCsv(#[source] csv::Error),
    }

    #[derive(serde::Serialize)]
    pub struct ValueSchema {
        pub table: &'static str,
        pub val: u8,
        pub name: String,
        pub desc: String,
        pub is_light: bool,
    }

    impl ValueSchema {
        pub fn all_values(maps: &ValueMaps) -> Vec<Self> {
            let tables: [(&'static str, &crate::valuemap::ValueMap); 7] = [
                ("circuitFunctions", &maps.circuit_functions),
                ("heatModes", &maps.heat_modes),
                ("heatSources", &maps.heat_sources),
                ("pumpTypes", &maps.pump_types),
                ("lightThemes", &maps.light_themes),
                ("scheduleDays", &maps.schedule_days),
                ("virtualCircuits", &maps.virtual_circuits),
            ];
            let mut values = Vec::new();
            for (table, map) in tables {
                for tag in map.to_array() {
                    values.push(ValueSchema {
                        table,
                        val: tag.val,
                        name: tag.name.into_owned(),
                        desc: tag.desc.into_owned(),
                        is_light: tag.is_light,
                    });
                }
            }
            values
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_uppercase();
            if self.table.to_uppercase().contains(&pattern) {
                return true;
            }
            if self.name.to_uppercase().contains(&pattern) {
                return true;
            }
            if self.desc.to_uppercase().contains(&pattern) {
                return true;
            }
            false
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        use std::io::Write as _;
        let mut output_writer: Box<dyn std::io::Write> = match &args.file {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };

        let dialect = dialect_for(args.family);
        let values: Vec<_> = ValueSchema::all_values(dialect.value_maps())
            .into_iter()
            .filter(|v| args.filter.as_deref().is_none_or(|p| v.is_match(p)))
            .collect();
        let data = match args.format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table
                    .set_header(vec!["Table", "Val", "Name", "Description", "Light"])
                    .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                for value in &values {
                    table.add_row(vec![
                        value.table.to_string(),
                        value.val.to_string(),
                        value.name.clone(),
                        value.desc.clone(),
                        if value.is_light { "yes".to_string() } else { String::new() },
                    ]);
                }
                table.to_string().into_bytes()
            }
            Format::Json => serde_json::to_vec(&values).map_err(Error::SerializeJson)?,
            Format::Csv => {
                let mut bytes = Vec::new();
                let mut writer = csv::Writer::from_writer(&mut bytes);
                for value in &values {
                    writer.serialize(value).map_err(Error::SerializeCsv)?;
                }
                drop(writer);
                bytes
            }
        };
        output_writer.write_all(&data).map_err(|e| match args.file {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p),
        })?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn every_family_dumps_some_values() {
            use strum::IntoEnumIterator as _;
            for family in ControllerFamily::iter() {
                let dialect = dialect_for(family);
                let values = ValueSchema::all_values(dialect.value_maps());
                assert!(!values.is_empty(), "{family}");
            }
        }

        #[test]
        fn filter_matches_table_names_case_insensitively() {
            let dialect = dialect_for(ControllerFamily::Easytouch);
            let values = ValueSchema::all_values(dialect.value_maps());
            let themes: Vec<_> =
                values.iter().filter(|v| v.is_match("lightthemes")).collect();
            assert!(!themes.is_empty());
            assert!(themes.iter().all(|v| v.table == "lightThemes"));
        }
    }
}

pub mod ranges {
    use crate::boards::{ControllerFamily, dialect_for};
    use crate::model::EquipmentModel;

    #[derive(clap::ValueEnum, Clone, Debug)]
    pub enum Format {
        Table,
        Json,
    }

    /// Output the equipment id address spaces of a controller family.
    ///
    /// Some bounds depend on the installed panel, so they are resolved against the
    /// capacities given on the command line.
    #[derive(clap::Parser)]
    pub struct Args {
        #[arg(value_enum)]
        family: ControllerFamily,
        #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
        format: Format,
        /// Resolve dynamic bounds as a shared-body (pool and spa) panel.
        #[arg(long, default_value_t = true)]
        shared: bool,
        #[arg(long, default_value_t = 10)]
        circuits: u8,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
        #[error("could not serialize ranges to JSON")]
        SerializeJson(#[source] serde_json::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RangeSchema {
        pub equipment: &'static str,
        pub start: u8,
        pub end: u8,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let dialect = dialect_for(args.family);
        let mut model = EquipmentModel::default();
        model.limits.shared = args.shared;
        model.limits.max_circuits = args.circuits;
        let ids = dialect.equipment_ids();
        let ranges = [
            ("circuits", &ids.circuits),
            ("features", &ids.features),
            ("pumps", &ids.pumps),
            ("circuitGroups", &ids.circuit_groups),
            ("virtualCircuits", &ids.virtual_circuits),
            ("schedules", &ids.schedules),
        ]
        .map(|(equipment, range)| RangeSchema {
            equipment,
            start: range.start(&model),
            end: range.end(&model),
        });
        let data = match args.format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table
                    .set_header(vec!["Equipment", "Start", "End"])
                    .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                for range in &ranges {
                    let empty = range.start > range.end;
                    table.add_row(vec![
                        range.equipment.to_string(),
                        if empty { "-".to_string() } else { range.start.to_string() },
                        if empty { "-".to_string() } else { range.end.to_string() },
                    ]);
                }
                table.to_string().into_bytes()
            }
            Format::Json => serde_json::to_vec(&ranges).map_err(Error::SerializeJson)?,
        };
        use std::io::Write as _;
        std::io::stdout().lock().write_all(&data).map_err(Error::WriteStdout)?;
        Ok(())
    }
}

pub mod simulate {
    use crate::boards::{BoardAdapter, ControllerFamily, SystemContext};
    use crate::bus::{self, Bus, Transport};
    use crate::config::{QueueState, Tuning};
    use crate::model::{Body, Category, EquipmentModel};
    use crate::protocol::{Frame, OCP_ADDRESS, PLUGIN_ADDRESS};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use strum::IntoEnumIterator as _;
    use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

    /// Drive a full configuration fetch against a scripted panel and print the
    /// progress transitions.
    ///
    /// Useful for eyeballing drain pacing and retry tuning without hardware on
    /// the bus.
    #[derive(clap::Parser)]
    pub struct Args {
        #[arg(value_enum)]
        family: ControllerFamily,
        #[command(flatten)]
        bus: bus::Args,
        /// Settle time between queueing and the first poll.
        #[arg(long, default_value = "100ms")]
        settle: humantime::Duration,
        /// Installed circuit count of the simulated panel.
        #[arg(long, default_value_t = 10)]
        circuits: u8,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
        #[error("the reconciler went away before finishing")]
        ReconcilerGone,
    }

    /// A panel that immediately acknowledges everything it is asked.
    struct ScriptedPanel {
        family: ControllerFamily,
        reply_tx: UnboundedSender<Frame>,
        reply_rx: UnboundedReceiver<Frame>,
    }

    impl ScriptedPanel {
        fn new(family: ControllerFamily) -> Self {
            let (reply_tx, reply_rx) = mpsc::unbounded_channel();
            Self { family, reply_tx, reply_rx }
        }

        fn replies(&self, frame: &Frame) -> Vec<Frame> {
            match self.family {
                ControllerFamily::Intellicenter => match frame.action {
                    222 => {
                        let mut payload = frame.payload.clone();
                        // The pump count page announces two installed pumps.
                        if payload.first() == Some(&(Category::Pumps as u8))
                            && payload.get(1) == Some(&0)
                        {
                            payload.push(2);
                        }
                        vec![Frame::new(OCP_ADDRESS, PLUGIN_ADDRESS, 30, payload)]
                    }
                    168 => vec![Frame::new(OCP_ADDRESS, PLUGIN_ADDRESS, 1, vec![168])],
                    _ => Vec::new(),
                },
                ControllerFamily::Intellitouch
                | ControllerFamily::Easytouch
                | ControllerFamily::Suntouch => {
                    if frame.action & 0xC0 == 0xC0 {
                        // Config replies answer in the 0x80 code space.
                        vec![Frame::new(
                            OCP_ADDRESS,
                            PLUGIN_ADDRESS,
                            0x80 | (frame.action & 0x3F),
                            frame.payload.clone(),
                        )]
                    } else {
                        vec![Frame::new(OCP_ADDRESS, PLUGIN_ADDRESS, 1, vec![frame.action])]
                    }
                }
                // These never expect an answer.
                ControllerFamily::Aqualink | ControllerFamily::Virtual => Vec::new(),
            }
        }
    }

    impl Transport for ScriptedPanel {
        fn send(&mut self, frame: Frame) -> impl Future<Output = std::io::Result<()>> + Send {
            for reply in self.replies(&frame) {
                let _ = self.reply_tx.send(reply);
            }
            std::future::ready(Ok(()))
        }

        fn recv(&mut self) -> impl Future<Output = Option<Frame>> + Send {
            self.reply_rx.recv()
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        runtime.block_on(drive(args))
    }

    async fn drive(args: Args) -> Result<(), Error> {
        use std::io::Write as _;
        let panel = ScriptedPanel::new(args.family);
        let (bus, frames) = Bus::spawn(panel, args.bus);
        let mut model = EquipmentModel::default();
        model.limits.shared = true;
        model.limits.max_circuits = args.circuits;
        model.limits.max_schedules = 12;
        model.bodies.push(Body { id: 1, name: "Pool".into(), ..Body::default() });
        model.bodies.push(Body { id: 2, name: "Spa".into(), ..Body::default() });
        let model = Arc::new(Mutex::new(model));
        let ctx = SystemContext { model: Arc::clone(&model), bus: bus.handle() };
        let tuning = Tuning { settle: *args.settle, stale_after: Duration::from_secs(300) };
        let adapter = BoardAdapter::attach(args.family, ctx, tuning, frames);
        adapter.request_configuration();

        let mut stdout = std::io::stdout().lock();
        let mut progress = adapter.progress();
        loop {
            progress.changed().await.map_err(|_| Error::ReconcilerGone)?;
            let current = *progress.borrow();
            writeln!(stdout, "{:?} {}%", current.state, current.percent)
                .map_err(Error::WriteStdout)?;
            if current.state == QueueState::Idle {
                break;
            }
        }
        let model = model.lock().unwrap_or_else(|e| e.into_inner());
        for category in Category::iter() {
            writeln!(stdout, "{category}: v{}", model.versions.get(category))
                .map_err(Error::WriteStdout)?;
        }
        Ok(())
    }
}
