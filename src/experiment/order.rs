//! Multi-order experiment tables.
//!
//! An order table is a CSV file with one row per order:
//!
//! | column | meaning |
//! |---|---|
//! | `Order` | 1-based order number |
//! | `A_step{k}_temperature`, `A_step{k}_time` | zone A program step k (°C, minutes) |
//! | `A_end_temperature`, `A_end_time` | zone A end step (time defaults to the end marker) |
//! | `B_…` | same for zone B |
//! | `{Gas}_step{k}_time`, `{Gas}_step{k}_flow` | gas ramp point k (`HH:MM:SS` since launch, flow) |
//! | `{Gas}_end_time`, `{Gas}_end_flow` | last ramp point |
//! | `threshold_low`, `threshold_high` | optional completion window on zone B |
//!
//! Any other column (substrate, precursor masses, ...) is carried through to
//! the result table untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{AppResult, RigError};
use crate::hardware::temperature::Zone;
use crate::protocol::aibus;

/// Column holding the order number.
pub const ORDER_COLUMN: &str = "Order";

/// Open interval on zone B's process value that counts as "done".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdWindow {
    /// Lower bound, exclusive
    pub low: f64,
    /// Upper bound, exclusive
    pub high: f64,
}

impl ThresholdWindow {
    /// True if `value` lies strictly inside the window.
    pub fn contains(&self, value: f64) -> bool {
        self.low < value && value < self.high
    }
}

/// One program step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgramStep {
    /// Target temperature, °C
    pub temperature: f64,
    /// Step length in minutes; negative marks the end of the program
    pub minutes: f64,
}

/// Temperature program of one zone. The last step is the end step.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    steps: Vec<ProgramStep>,
}

const MAX_PROGRAM_STEPS: usize =
    (aibus::PARAM_PROGRAM_LAST - aibus::PARAM_PROGRAM_BASE) as usize / 2 + 1;

impl Program {
    /// Program from steps, the last one being the end step.
    pub fn new(steps: Vec<ProgramStep>) -> AppResult<Self> {
        if steps.len() < 2 {
            return Err(RigError::Configuration(
                "A program needs at least one step plus the end step".into(),
            ));
        }
        if steps.len() > MAX_PROGRAM_STEPS {
            return Err(RigError::Configuration(format!(
                "Program has {} steps, the controller holds {MAX_PROGRAM_STEPS}",
                steps.len()
            )));
        }
        Ok(Self { steps })
    }

    /// All steps including the end step.
    pub fn steps(&self) -> &[ProgramStep] {
        &self.steps
    }

    /// Step index (1-based, as reported by the controller) of the last real
    /// step.
    pub fn final_step(&self) -> u32 {
        (self.steps.len() - 1) as u32
    }

    /// Total program length in minutes, end step excluded.
    pub fn total_minutes(&self) -> f64 {
        self.steps[..self.steps.len() - 1]
            .iter()
            .map(|s| s.minutes)
            .sum()
    }

    /// Flattened `temperature, minutes, ...` table written to parameters
    /// `80 + i`.
    pub fn table_entries(&self) -> Vec<f64> {
        self.steps
            .iter()
            .flat_map(|s| [s.temperature, s.minutes])
            .collect()
    }

    /// Percent of the program completed at `step` (1-based) with `minutes`
    /// spent in it, clamped to `0..=100`.
    pub fn progress_percent(&self, step: u32, minutes: f64) -> f64 {
        let total = self.total_minutes();
        if total <= 0.0 {
            return 0.0;
        }
        let completed_steps = (step.max(1) as usize - 1).min(self.steps.len() - 1);
        let done: f64 = self.steps[..completed_steps].iter().map(|s| s.minutes).sum();
        ((done + minutes.max(0.0)) / total * 100.0).clamp(0.0, 100.0)
    }
}

/// One point of a gas ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasPoint {
    /// Seconds since launch
    pub seconds: u64,
    /// Flow in the channel's unit
    pub flow: f64,
}

/// Flow ramp of one gas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GasProgram {
    /// Points in table order
    pub points: Vec<GasPoint>,
}

/// Parse `HH:MM:SS`, `MM:SS` or plain seconds.
pub fn parse_duration(text: &str) -> AppResult<u64> {
    let text = text.trim();
    let invalid = || RigError::Configuration(format!("Invalid time '{text}'"));
    if !text.contains(':') {
        let seconds: f64 = text.parse().map_err(|_| invalid())?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(invalid());
        }
        return Ok(seconds.round() as u64);
    }
    if text.split(':').count() > 3 {
        return Err(invalid());
    }
    text.split(':').try_fold(0u64, |acc, part| {
        let value: u64 = part.trim().parse().map_err(|_| invalid())?;
        acc.checked_mul(60)
            .and_then(|acc| acc.checked_add(value))
            .ok_or_else(invalid)
    })
}

/// One order, ready to launch.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentOrder {
    /// 1-based order number
    pub index: usize,
    /// Experiment the order belongs to
    pub experiment_id: String,
    /// Raw row, column order preserved
    pub row: Vec<(String, String)>,
    /// Zone A then zone B
    pub programs: [Program; 2],
    /// Gas ramps by gas name
    pub gases: BTreeMap<String, GasProgram>,
    /// Completion window on zone B
    pub threshold: ThresholdWindow,
}

impl ExperimentOrder {
    /// Program of one zone.
    pub fn program(&self, zone: Zone) -> &Program {
        &self.programs[zone.index()]
    }

    /// Raw row values in column order.
    pub fn values(&self) -> Vec<String> {
        self.row.iter().map(|(_, v)| v.clone()).collect()
    }
}

/// A loaded order table.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderTable {
    path: PathBuf,
    experiment_id: String,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl OrderTable {
    /// Load a table. The experiment id is the file stem.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)?;
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if !columns.iter().any(|c| c == ORDER_COLUMN) {
            return Err(RigError::Configuration(format!(
                "{} has no '{ORDER_COLUMN}' column",
                path.display()
            )));
        }
        let rows = reader
            .records()
            .map(|r| r.map(|record| record.iter().map(str::to_string).collect()))
            .collect::<Result<Vec<Vec<String>>, _>>()?;
        if rows.is_empty() {
            return Err(RigError::Configuration(format!(
                "{} contains no orders",
                path.display()
            )));
        }
        let experiment_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            experiment_id,
            columns,
            rows,
        })
    }

    /// Write JSON records (as received by `set-parameters`) as a CSV table.
    /// Columns are the union of all record keys, in map key order.
    pub fn write_records(path: impl AsRef<Path>, records: &[Map<String, Value>]) -> AppResult<()> {
        let path = path.as_ref();
        if records.is_empty() {
            return Err(RigError::Configuration("Parameter table is empty".into()));
        }
        let mut columns: Vec<&str> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !columns.contains(&key.as_str()) {
                    columns.push(key);
                }
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&columns)?;
        for record in records {
            let row = columns.iter().map(|c| match record.get(*c) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            });
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Source file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Experiment id (file stem).
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Header row.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of orders: the largest `Order` value, or the row count if no
    /// row has a numeric order.
    pub fn total_orders(&self) -> usize {
        self.rows
            .iter()
            .filter_map(|row| self.order_number(row))
            .max()
            .unwrap_or(self.rows.len())
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    fn order_number(&self, row: &[String]) -> Option<usize> {
        let value: f64 = row.get(self.column_index(ORDER_COLUMN)?)?.parse().ok()?;
        (value >= 1.0).then_some(value as usize)
    }

    /// Build order `index` (1-based). Rows are matched by their `Order` value.
    pub fn order(
        &self,
        index: usize,
        default_threshold: ThresholdWindow,
    ) -> AppResult<ExperimentOrder> {
        let row = self
            .rows
            .iter()
            .find(|row| self.order_number(row) == Some(index))
            .ok_or_else(|| RigError::Configuration(format!("No row for order {index}")))?;
        let view = RowView { table: self, row };

        let programs = [view.program(Zone::A)?, view.program(Zone::B)?];
        let mut gases = BTreeMap::new();
        for gas in self.gas_names() {
            let program = view.gas_program(&gas)?;
            if !program.points.is_empty() {
                gases.insert(gas, program);
            }
        }
        let threshold = ThresholdWindow {
            low: view.number("threshold_low")?.unwrap_or(default_threshold.low),
            high: view.number("threshold_high")?.unwrap_or(default_threshold.high),
        };
        if threshold.low >= threshold.high {
            return Err(RigError::Configuration(format!(
                "Order {index}: empty threshold window [{}, {}]",
                threshold.low, threshold.high
            )));
        }

        Ok(ExperimentOrder {
            index,
            experiment_id: self.experiment_id.clone(),
            row: self.columns.iter().cloned().zip(row.iter().cloned()).collect(),
            programs,
            gases,
            threshold,
        })
    }

    /// Gases with ramp columns, in header order.
    pub fn gas_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter_map(|c| c.strip_suffix("_step1_flow"))
            .map(str::to_string)
            .collect()
    }
}

struct RowView<'a> {
    table: &'a OrderTable,
    row: &'a [String],
}

impl RowView<'_> {
    fn has_column(&self, name: &str) -> bool {
        self.table.column_index(name).is_some()
    }

    fn text(&self, name: &str) -> Option<&str> {
        let value = self.row.get(self.table.column_index(name)?)?.as_str();
        (!value.is_empty()).then_some(value)
    }

    fn number(&self, name: &str) -> AppResult<Option<f64>> {
        self.text(name)
            .map(|v| {
                v.parse::<f64>().map_err(|_| {
                    RigError::Configuration(format!("Column '{name}': '{v}' is not a number"))
                })
            })
            .transpose()
    }

    fn required(&self, name: &str) -> AppResult<f64> {
        self.number(name)?
            .ok_or_else(|| RigError::Configuration(format!("Column '{name}' is empty")))
    }

    fn program(&self, zone: Zone) -> AppResult<Program> {
        let prefix = zone.label();
        let mut steps = Vec::new();
        for k in 1.. {
            let temperature = format!("{prefix}_step{k}_temperature");
            if !self.has_column(&temperature) || self.text(&temperature).is_none() {
                break;
            }
            steps.push(ProgramStep {
                temperature: self.required(&temperature)?,
                minutes: self.required(&format!("{prefix}_step{k}_time"))?,
            });
        }
        let last_temperature = steps.last().map(|s| s.temperature).ok_or_else(|| {
            RigError::Configuration(format!("Zone {prefix} has no program steps"))
        })?;
        steps.push(ProgramStep {
            temperature: self
                .number(&format!("{prefix}_end_temperature"))?
                .unwrap_or(last_temperature),
            minutes: self
                .number(&format!("{prefix}_end_time"))?
                .unwrap_or(aibus::END_MARKER_MINUTES),
        });
        Program::new(steps)
    }

    fn gas_point(&self, time: &str, flow: &str) -> AppResult<Option<GasPoint>> {
        let Some(time_text) = self.text(time) else {
            return Ok(None);
        };
        Ok(Some(GasPoint {
            seconds: parse_duration(time_text)?,
            flow: self.required(flow)?,
        }))
    }

    fn gas_program(&self, gas: &str) -> AppResult<GasProgram> {
        let mut points = Vec::new();
        for k in 1.. {
            let time = format!("{gas}_step{k}_time");
            if !self.has_column(&time) {
                break;
            }
            match self.gas_point(&time, &format!("{gas}_step{k}_flow"))? {
                Some(point) => points.push(point),
                None => break,
            }
        }
        let end = self.gas_point(&format!("{gas}_end_time"), &format!("{gas}_end_flow"))?;
        if let Some(point) = end {
            points.push(point);
        }
        Ok(GasProgram { points })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const WINDOW: ThresholdWindow = ThresholdWindow {
        low: 10.0,
        high: 15.0,
    };

    fn table(contents: &str) -> (tempfile::TempDir, OrderTable) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp42.csv");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(contents.as_bytes())
            .unwrap();
        let table = OrderTable::load(&path).unwrap();
        (dir, table)
    }

    const TABLE: &str = "\
Order,Substrate,A_step1_temperature,A_step1_time,A_end_temperature,A_end_time,B_step1_temperature,B_step1_time,B_step2_temperature,B_step2_time,B_end_temperature,B_end_time,Ar_step1_time,Ar_step1_flow,Ar_end_time,Ar_end_flow,H2_step1_time,H2_step1_flow,H2_end_time,H2_end_flow
1,SiO2,500,30,500,-121,800,20,800,40,25,-121,00:00:00,100,01:00:00,0,00:00:00,1.31,01:00:00,0
2,Sapphire,550,30,,,850,20,,,,,0,200,,,0,0,,
";

    #[test]
    fn loads_orders_and_programs() {
        let (_dir, table) = table(TABLE);
        assert_eq!(table.experiment_id(), "exp42");
        assert_eq!(table.total_orders(), 2);
        let order = table.order(1, WINDOW).unwrap();
        let b = order.program(Zone::B);
        assert_eq!(b.steps().len(), 3);
        assert_eq!(b.final_step(), 2);
        assert_eq!(b.total_minutes(), 60.0);
        assert_eq!(order.gases["Ar"].points[1], GasPoint { seconds: 3600, flow: 0.0 });
        assert_eq!(order.row[1], ("Substrate".into(), "SiO2".into()));
    }

    #[test]
    fn blank_cells_end_the_program() {
        let (_dir, table) = table(TABLE);
        let order = table.order(2, WINDOW).unwrap();
        let b = order.program(Zone::B);
        assert_eq!(b.steps().len(), 2);
        assert_eq!(b.steps()[1].minutes, aibus::END_MARKER_MINUTES);
        assert_eq!(b.steps()[1].temperature, 850.0);
        assert_eq!(order.gases["Ar"].points.len(), 1);
    }

    #[test]
    fn missing_order_is_a_configuration_error() {
        let (_dir, table) = table(TABLE);
        assert!(matches!(table.order(3, WINDOW), Err(RigError::Configuration(_))));
    }

    #[test]
    fn bad_number_names_the_column() {
        let (_dir, table) = table(
            "Order,A_step1_temperature,A_step1_time,B_step1_temperature,B_step1_time\n1,hot,10,500,10\n",
        );
        let err = table.order(1, WINDOW).unwrap_err();
        assert!(err.to_string().contains("A_step1_temperature"));
    }

    #[test]
    fn progress_follows_completed_steps() {
        let program = Program::new(vec![
            ProgramStep { temperature: 100.0, minutes: 10.0 },
            ProgramStep { temperature: 200.0, minutes: 30.0 },
            ProgramStep { temperature: 25.0, minutes: -121.0 },
        ])
        .unwrap();
        assert_eq!(program.progress_percent(1, 5.0), 12.5);
        assert_eq!(program.progress_percent(2, 15.0), 62.5);
        assert_eq!(program.progress_percent(3, 0.0), 100.0);
        assert_eq!(program.table_entries(), vec![100.0, 10.0, 200.0, 30.0, 25.0, -121.0]);
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("01:02:03").unwrap(), 3723);
        assert_eq!(parse_duration("2:30").unwrap(), 150);
        assert_eq!(parse_duration("90").unwrap(), 90);
        assert!(parse_duration("1:x:0").is_err());
        assert!(parse_duration("-5").is_err());
        assert!(parse_duration("1:00:00:00").is_err());
        assert!(parse_duration("18446744073709551615:0").is_err());
        assert!(parse_duration("0:18446744073709551615").is_ok());
    }

    #[test]
    fn json_records_round_trip_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.csv");
        let records: Vec<Map<String, Value>> = serde_json::from_str(
            r#"[{"Order": 1, "A_step1_temperature": 500, "A_step1_time": 10,
                 "B_step1_temperature": 600, "B_step1_time": 10, "Substrate": "Si"}]"#,
        )
        .unwrap();
        OrderTable::write_records(&path, &records).unwrap();
        let table = OrderTable::load(&path).unwrap();
        assert_eq!(table.experiment_id(), "remote");
        let order = table.order(1, WINDOW).unwrap();
        assert_eq!(order.program(Zone::A).steps()[0].temperature, 500.0);
    }
}
