//! Decodes reaction packets and writes the results file.
//!
//! After every trial the controller box sends one 36-byte packet. The first
//! four bytes pack a two-bit key code for each of the 16 response boxes,
//! four boxes to a byte, lowest bits first. The remaining 32 bytes are one
//! little-endian 16-bit timer count per box.
//!
//! A [`ResultSet`] collects the decoded packets of one run in a
//! `[box][trial]` grid and renders them as a tab-separated table.

use chrono::{DateTime, Local};
use log::{debug, info};
use std::{
    borrow::Cow,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    link::REACTION_PACKET_LEN,
    tms::{ExperimentPlan, TrialSpec},
};

/// Number of participant response boxes on one controller box.
pub const BOX_COUNT: usize = 16;

/// Name of the directory, next to the TMS file, that results go into.
pub const RESULTS_DIR: &str = "results";

/// Fixed columns of the results table. The plan's code header follows.
pub const RESULTS_HEADER: &str = "Item\tFile\tDate Time SJ\tTarget\tReacTime\tKey\t";

/// Date format for result rows and file names: `dd.MM.yy`.
pub const DATE_FORMAT: &str = "%d.%m.%y";

/// Time format for result rows and file names: `HH.mm.ss`.
pub const TIME_FORMAT: &str = "%H.%M.%S";

const KEY_MASKS: [u8; 4] = [0b11, 0b1100, 0b11_0000, 0b1100_0000];
const KEY_SHIFTS: [u32; 4] = [0, 2, 4, 6];

/// A response key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCode {
    /// Box code 1.
    Left,
    /// Box code 2.
    Right,
    /// Box code 3.
    Middle,
}

impl KeyCode {
    /// Maps a two-bit code from the packet to a key. `0` means no press.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(KeyCode::Left),
            2 => Some(KeyCode::Right),
            3 => Some(KeyCode::Middle),
            _ => None,
        }
    }

    /// The key as it appears in the results file: numbered left to right.
    pub fn numeric(self) -> &'static str {
        match self {
            KeyCode::Left => "1",
            KeyCode::Middle => "2",
            KeyCode::Right => "3",
        }
    }
}

/// Zero-based position of a trial in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrialIndex(pub usize);

/// Zero-based response box number, always below [`BOX_COUNT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoxIndex(usize);

impl BoxIndex {
    /// `None` when `index` is not a box.
    pub fn new(index: usize) -> Option<Self> {
        (index < BOX_COUNT).then_some(BoxIndex(index))
    }

    /// Every box, in order.
    pub fn all() -> impl Iterator<Item = BoxIndex> {
        (0..BOX_COUNT).map(BoxIndex)
    }

    /// The zero-based box number.
    pub fn get(self) -> usize {
        self.0
    }
}

/// The raw per-trial reply from the controller box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactionPacket([u8; REACTION_PACKET_LEN]);

impl From<[u8; REACTION_PACKET_LEN]> for ReactionPacket {
    fn from(bytes: [u8; REACTION_PACKET_LEN]) -> Self {
        ReactionPacket(bytes)
    }
}

impl ReactionPacket {
    /// The two-bit key code of one box.
    pub fn key_code(&self, b: BoxIndex) -> u8 {
        let b = b.get();
        (self.0[b / 4] & KEY_MASKS[b % 4]) >> KEY_SHIFTS[b % 4]
    }

    /// The box's timer count, before the plan's offset is applied.
    pub fn raw_time(&self, b: BoxIndex) -> i32 {
        let x = 4 + 2 * b.get();
        i32::from(self.0[x]) + i32::from(self.0[x + 1]) * 256
    }
}

/// What one box did in one trial.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrialResult {
    /// `None` if the box did not respond.
    pub pressed_key: Option<KeyCode>,
    /// Only meaningful when a key was pressed; `0` otherwise.
    pub reaction_time_ms: i32,
}

impl TrialResult {
    /// Decodes one box's part of a packet.
    pub fn decode(packet: &ReactionPacket, b: BoxIndex, reaction_offset_ms: i32) -> Self {
        match KeyCode::from_code(packet.key_code(b)) {
            Some(key) => TrialResult {
                pressed_key: Some(key),
                reaction_time_ms: packet.raw_time(b) - reaction_offset_ms,
            },
            None => TrialResult::default(),
        }
    }

    /// The key column of the results file.
    pub fn key_column(&self) -> &'static str {
        self.pressed_key.map_or(".", KeyCode::numeric)
    }
}

/// One responding box in one trial, as it goes into the results file.
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct ResultRow<'a> {
    pub trial: TrialIndex,
    pub box_index: BoxIndex,
    pub result: &'a TrialResult,
    pub spec: &'a TrialSpec,
}

/// Errors saving results.
#[derive(Debug)]
#[allow(missing_docs)]
pub enum ResultsError {
    /// A packet was recorded for a trial the plan does not have.
    TrialOutOfRange { trial: usize, trial_count: usize },

    /// The plan was not read from a file, so there is nowhere to put results.
    NoSourceFile,

    /// The results directory could not be created.
    CreateDir { path: PathBuf, source: io::Error },

    /// The results file could not be written.
    Write { path: PathBuf, source: io::Error },
}

impl fmt::Display for ResultsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ResultsError as RE;
        let msg = match self {
            RE::TrialOutOfRange { trial, trial_count } => Cow::from(format!(
                "trial {} is out of range, the plan has {} trials",
                trial + 1,
                trial_count
            )),
            RE::NoSourceFile => Cow::from("the plan has no source file"),
            RE::CreateDir { path, source } => Cow::from(format!(
                "could not create results directory {}: {}",
                path.display(),
                source
            )),
            RE::Write { path, source } => Cow::from(format!(
                "could not create results file {}: {}",
                path.display(),
                source
            )),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ResultsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResultsError::CreateDir { source, .. } | ResultsError::Write { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

/// Decoded reactions of one run.
#[derive(Debug, Clone)]
pub struct ResultSet {
    plan: Arc<ExperimentPlan>,
    /// `grid[box][trial]`
    grid: Vec<Vec<TrialResult>>,
    recorded: Vec<bool>,
}

impl ResultSet {
    /// An empty grid sized for `plan`.
    pub fn new(plan: Arc<ExperimentPlan>) -> Self {
        let trials = plan.trial_count();
        ResultSet {
            grid: vec![vec![TrialResult::default(); trials]; BOX_COUNT],
            recorded: vec![false; trials],
            plan,
        }
    }

    /// The plan the grid was sized for.
    pub fn plan(&self) -> &Arc<ExperimentPlan> {
        &self.plan
    }

    /// What box `b` did in `trial`, `None` past the end of the plan.
    pub fn get(&self, trial: TrialIndex, b: BoxIndex) -> Option<&TrialResult> {
        self.grid[b.get()].get(trial.0)
    }

    /// Decodes `packet` into the column for `trial`, overwriting what was
    /// there.
    pub fn record(&mut self, packet: &ReactionPacket, trial: TrialIndex) -> Result<(), ResultsError> {
        let spec = self
            .plan
            .trials()
            .get(trial.0)
            .ok_or(ResultsError::TrialOutOfRange {
                trial: trial.0,
                trial_count: self.plan.trial_count(),
            })?;
        let offset = spec.reaction_offset_ms;

        for b in BoxIndex::all() {
            self.grid[b.get()][trial.0] = TrialResult::decode(packet, b, offset);
        }
        self.recorded[trial.0] = true;
        Ok(())
    }

    /// How many trials have a packet recorded.
    pub fn trials_recorded(&self) -> usize {
        self.recorded.iter().filter(|&&r| r).count()
    }

    /// Every box that pressed a key, trial by trial.
    pub fn rows(&self) -> impl Iterator<Item = ResultRow<'_>> {
        self.plan
            .trials()
            .iter()
            .enumerate()
            .flat_map(move |(t, spec)| {
                BoxIndex::all().filter_map(move |b| {
                    let result = self.get(TrialIndex(t), b)?;
                    result.pressed_key.map(|_| ResultRow {
                        trial: TrialIndex(t),
                        box_index: b,
                        result,
                        spec,
                    })
                })
            })
    }

    /// Number of responses over the whole run.
    pub fn responses(&self) -> usize {
        self.rows().count()
    }

    /// The results table, stamped with `date` and `time`.
    pub fn render(&self, date: &str, time: &str) -> String {
        let mut out = format!("{}{}\n", RESULTS_HEADER, self.plan.code_header());
        let source = self.plan.source_path().display();
        for row in self.rows() {
            out.push_str(&format!(
                "{}\t{}\t{} {} {:02}\t{}\t{}\t{}\t{}\n",
                row.trial.0 + 1,
                source,
                date,
                time,
                row.box_index.get(),
                row.spec.screen_item,
                row.result.reaction_time_ms,
                row.result.key_column(),
                row.spec.coding_tag,
            ));
        }
        out
    }

    /// Writes the table to `results/` next to the TMS file and returns the
    /// path of the new file.
    pub fn write_to_disk(&self, at: DateTime<Local>) -> Result<PathBuf, ResultsError> {
        let source = self.plan.source_path();
        let file_name = source.file_name().ok_or(ResultsError::NoSourceFile)?;
        let dir = results_dir(source);
        fs::create_dir_all(&dir).map_err(|source| ResultsError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let date = at.format(DATE_FORMAT).to_string();
        let time = at.format(TIME_FORMAT).to_string();
        let path = dir.join(format!(
            "{}_{}_{}.txt",
            file_name.to_string_lossy(),
            date,
            time
        ));

        debug!("writing {} responses to {}", self.responses(), path.display());
        fs::write(&path, self.render(&date, &time)).map_err(|source| ResultsError::Write {
            path: path.clone(),
            source,
        })?;
        info!("results written to {}", path.display());
        Ok(path)
    }
}

/// The results directory for a TMS file.
pub fn results_dir(source: &Path) -> PathBuf {
    source
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(RESULTS_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tms;
    use chrono::TimeZone;
    use std::io::Write;

    const BIAS: i32 = 500;

    fn plan_text(trials: usize, offset: i32) -> String {
        let mut text = String::from("Title\nVersion 2\nCond\tList\n");
        for t in 0..trials {
            text.push_str(&format!("2000.0\t{}.0\tA{}\tx\n", offset, t));
            text.push_str(&format!("item{}\t100\t200\n", t));
        }
        text
    }

    fn plan(trials: usize, offset: i32) -> Arc<ExperimentPlan> {
        Arc::new(tms::parse_str(&plan_text(trials, offset)).unwrap())
    }

    fn packet_with(b: usize, code: u8, raw: u16) -> ReactionPacket {
        let mut bytes = [0u8; REACTION_PACKET_LEN];
        bytes[b / 4] |= code << (2 * (b % 4));
        let [lo, hi] = raw.to_le_bytes();
        bytes[4 + 2 * b] = lo;
        bytes[5 + 2 * b] = hi;
        ReactionPacket::from(bytes)
    }

    #[test]
    fn key_codes() {
        assert_eq!(KeyCode::from_code(0), None);
        assert_eq!(KeyCode::from_code(1), Some(KeyCode::Left));
        assert_eq!(KeyCode::from_code(2), Some(KeyCode::Right));
        assert_eq!(KeyCode::from_code(3), Some(KeyCode::Middle));
        assert_eq!(KeyCode::Left.numeric(), "1");
        assert_eq!(KeyCode::Middle.numeric(), "2");
        assert_eq!(KeyCode::Right.numeric(), "3");
    }

    #[test]
    fn decoding_is_deterministic_for_every_box_and_code() {
        for b in BoxIndex::all() {
            for code in 0..4u8 {
                let packet = packet_with(b.get(), code, 1234);
                let first = TrialResult::decode(&packet, b, 0);
                assert_eq!(first, TrialResult::decode(&packet, b, 0));
                assert_eq!(packet.key_code(b), code);
                if code == 0 {
                    assert_eq!(first, TrialResult::default());
                    assert_eq!(first.reaction_time_ms, 0);
                    assert_eq!(first.key_column(), ".");
                } else {
                    assert_eq!(first.reaction_time_ms, 1234);
                }
                // neighbours are untouched
                for other in BoxIndex::all().filter(|&o| o != b) {
                    assert_eq!(packet.key_code(other), 0);
                }
            }
        }
    }

    #[test]
    fn reaction_time_subtracts_offset() {
        let plan = plan(1, BIAS);
        for b in [0, 3, 9, 12, 15] {
            for v in [0, 250, 1000, 3123] {
                let mut results = ResultSet::new(Arc::clone(&plan));
                let packet = packet_with(b, 2, (v + BIAS) as u16);
                results.record(&packet, TrialIndex(0)).unwrap();

                let idx = BoxIndex::new(b).unwrap();
                let result = results.get(TrialIndex(0), idx).unwrap();
                assert_eq!(result.pressed_key, Some(KeyCode::Right));
                assert_eq!(result.reaction_time_ms, v);
            }
        }
    }

    #[test]
    fn zero_responses_render_header_only() {
        let mut results = ResultSet::new(plan(3, 0));
        for t in 0..3 {
            results
                .record(&ReactionPacket::from([0; REACTION_PACKET_LEN]), TrialIndex(t))
                .unwrap();
        }
        assert_eq!(results.trials_recorded(), 3);
        assert_eq!(
            results.render("05.03.24", "14.07.09"),
            "Item\tFile\tDate Time SJ\tTarget\tReacTime\tKey\tCond\tList\n"
        );
    }

    #[test]
    fn rows_only_for_responding_boxes() {
        let mut results = ResultSet::new(plan(2, 100));
        results
            .record(&packet_with(4, 1, 600), TrialIndex(1))
            .unwrap();

        assert_eq!(results.responses(), 1);
        let rendered = results.render("05.03.24", "14.07.09");
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "2\t\t05.03.24 14.07.09 04\titem1\t500\t1\tA1\tx");
    }

    #[test]
    fn out_of_range_trial() {
        let mut results = ResultSet::new(plan(1, 0));
        let packet = ReactionPacket::from([0; REACTION_PACKET_LEN]);
        assert!(matches!(
            results.record(&packet, TrialIndex(1)),
            Err(ResultsError::TrialOutOfRange { trial: 1, trial_count: 1 })
        ));
        assert!(BoxIndex::new(16).is_none());
    }

    #[test]
    fn writes_results_beside_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words.tms");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(plan_text(1, 0).as_bytes()).unwrap();

        let plan = Arc::new(tms::parse(&path).unwrap());
        let mut results = ResultSet::new(plan);
        results.record(&packet_with(0, 3, 777), TrialIndex(0)).unwrap();

        let at = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let written = results.write_to_disk(at).unwrap();
        assert_eq!(
            written,
            dir.path().join("results").join("words.tms_05.03.24_14.07.09.txt")
        );

        let contents = fs::read_to_string(&written).unwrap();
        assert!(contents.ends_with("\t777\t2\tA0\tx\n"));
        assert!(contents.contains(&path.display().to_string()));
    }

    #[test]
    fn needs_a_source_file() {
        let results = ResultSet::new(plan(1, 0));
        assert!(matches!(
            results.write_to_disk(Local::now()),
            Err(ResultsError::NoSourceFile)
        ));
    }
}
