// Viewer state: a circular raster with one row per (probe, channel).

use std::collections::BTreeMap;

use crate::backend::RasterBackend;

pub struct App<B: RasterBackend> {
    pub backend: B,
    pub instants: u64,
    pub width: usize,
    pub labels: Vec<String>,
    rows: BTreeMap<(String, Vec<i64>), usize>,
    pub raster: Vec<Vec<char>>, // [row][col]
    pub running: bool,
    pub done: bool,
    pub error: Option<String>,
}

impl<B: RasterBackend> App<B> {
    pub fn new(backend: B, width: usize) -> Self {
        Self {
            backend,
            instants: 0,
            width: width.max(1),
            labels: Vec::new(),
            rows: BTreeMap::new(),
            raster: Vec::new(),
            running: false,
            done: false,
            error: None,
        }
    }

    pub fn toggle_running(&mut self) {
        if !self.done {
            self.running = !self.running;
        }
    }

    fn row(&mut self, probe: &str, idx: &[i64]) -> usize {
        let key = (probe.to_string(), idx.to_vec());
        if let Some(&r) = self.rows.get(&key) {
            return r;
        }
        let r = self.raster.len();
        let label = match idx {
            [] => probe.to_string(),
            [ch] => format!("{probe}[{ch}]"),
            _ => format!("{probe}{idx:?}"),
        };
        self.labels.push(label);
        self.raster.push(vec![' '; self.width]);
        self.rows.insert(key, r);
        r
    }

    /// Advance one instant and paint its column.
    pub fn step(&mut self) {
        if self.done {
            return;
        }
        let batch = match self.backend.step() {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                self.done = true;
                self.running = false;
                return;
            }
            Err(e) => {
                self.error = Some(format!("{e:#}"));
                self.done = true;
                self.running = false;
                return;
            }
        };

        self.instants = self.instants.saturating_add(1);
        let col = (self.instants as usize) % self.width;
        for row in &mut self.raster {
            row[col] = ' ';
        }
        for rec in batch {
            let r = self.row(&rec.probe, &rec.idx);
            self.raster[r][col] = '•';
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TraceBackend;
    use eir_core::{Meta, Value};
    use eir_runtime::Trace;

    #[test]
    fn rows_appear_in_first_seen_order() {
        let mut t = Trace::new();
        for (p, ts, ch) in [("b", 1, 3), ("a", 1, 0), ("b", 2, 3)] {
            t.record(p, ts, vec![ch], Value::Scalar(1.0), Meta::new());
        }
        let mut app = App::new(TraceBackend::new(t, "t"), 4);
        app.step();
        app.step();
        assert_eq!(app.labels, vec!["a[0]", "b[3]"]);
        assert_eq!(app.raster[1][1], '•');
        assert_eq!(app.raster[1][2], '•');
        assert_eq!(app.raster[0][2], ' ');
        app.step();
        assert!(app.done);
        assert_eq!(app.instants, 2);
    }
}
