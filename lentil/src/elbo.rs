use crate::node::NodeKind;

/// ELBO terms of one evaluated iteration
#[derive(Clone, Debug, PartialEq)]
pub struct ElboRecord {
    pub iter: usize,
    terms: [Option<f64>; NodeKind::COUNT],
    total: f64,
}

impl ElboRecord {
    pub fn new(iter: usize) -> Self {
        Self {
            iter,
            terms: [None; NodeKind::COUNT],
            total: 0.,
        }
    }

    /// Record (or overwrite) one node's contribution
    pub fn set(&mut self, kind: NodeKind, value: f64) {
        self.terms[kind.index()] = Some(value);
        self.total = self.terms.iter().flatten().sum();
    }

    pub fn get(&self, kind: NodeKind) -> Option<f64> {
        self.terms[kind.index()]
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn terms(&self) -> impl Iterator<Item = (NodeKind, f64)> + '_ {
        NodeKind::ALL
            .iter()
            .filter_map(|&k| self.terms[k.index()].map(|v| (k, v)))
    }
}

/// Append-only list of ELBO records
#[derive(Clone, Debug, Default)]
pub struct ElboLedger {
    records: Vec<ElboRecord>,
}

impl ElboLedger {
    pub fn push(&mut self, record: ElboRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[ElboRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Header `iter total <node>...` and one line per record,
    /// `NaN` for nodes without a term
    pub fn to_lines(&self) -> Vec<Box<str>> {
        let mut ret = Vec::with_capacity(self.records.len() + 1);
        let names = NodeKind::ALL.iter().map(|k| k.name()).collect::<Vec<_>>();
        ret.push(format!("iter\ttotal\t{}", names.join("\t")).into_boxed_str());
        for rec in &self.records {
            let terms = rec
                .terms
                .iter()
                .map(|x| x.unwrap_or(f64::NAN).to_string())
                .collect::<Vec<_>>();
            ret.push(format!("{}\t{}\t{}", rec.iter, rec.total, terms.join("\t")).into_boxed_str());
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_is_sum_of_terms() {
        let mut rec = ElboRecord::new(3);
        rec.set(NodeKind::Y, -100.5);
        rec.set(NodeKind::Tau, 2.25);
        rec.set(NodeKind::Z, -7.0);
        approx::assert_relative_eq!(rec.total(), -105.25);

        rec.set(NodeKind::Z, -8.0);
        approx::assert_relative_eq!(rec.total(), -106.25);
        assert_eq!(rec.get(NodeKind::W), None);
        assert_eq!(rec.terms().count(), 3);

        let mut ledger = ElboLedger::default();
        ledger.push(rec);
        let lines = ledger.to_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("3\t-106.25\t"));
    }
}
