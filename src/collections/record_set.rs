use lancast_proto::packet::record::Record;
use std::collections::HashMap;

/// A set of records keyed on the record hash, with the set algebra the
/// probe and responder logic runs on. Within a collection no two records
/// share a hash: re-adding replaces.
#[derive(Debug, Clone, Default)]
pub struct RecordCollection {
    records: HashMap<u32, Record>,
}

impl RecordCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: Record) {
        self.records.insert(record.hash(), record);
    }

    pub fn add_each(&mut self, records: impl IntoIterator<Item = Record>) {
        for record in records {
            self.add(record);
        }
    }

    pub fn has(&self, record: &Record) -> bool {
        self.records.contains_key(&record.hash())
    }

    pub fn get(&self, record: &Record) -> Option<&Record> {
        self.records.get(&record.hash())
    }

    pub fn delete(&mut self, record: &Record) -> Option<Record> {
        self.records.remove(&record.hash())
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn to_vec(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }

    /// Records sharing identity (name, type, class) with the given one.
    pub fn with_namehash(&self, namehash: u32) -> Vec<&Record> {
        self.records
            .values()
            .filter(|record| record.namehash() == namehash)
            .collect()
    }

    pub fn intersection(&self, other: &RecordCollection) -> RecordCollection {
        RecordCollection {
            records: self
                .records
                .iter()
                .filter(|(hash, _)| other.records.contains_key(hash))
                .map(|(hash, record)| (*hash, record.clone()))
                .collect(),
        }
    }

    pub fn difference(&self, other: &RecordCollection) -> RecordCollection {
        RecordCollection {
            records: self
                .records
                .iter()
                .filter(|(hash, _)| !other.records.contains_key(hash))
                .map(|(hash, record)| (*hash, record.clone()))
                .collect(),
        }
    }

    /// Records in `other` that conflict with a record in this set, computed
    /// after removing the exact intersection from both sides so duplicated
    /// entries never count as conflicts.
    pub fn get_conflicts(&self, other: &RecordCollection) -> Vec<Record> {
        let ours = self.difference(other);
        let theirs = other.difference(self);
        theirs
            .records
            .values()
            .filter(|candidate| {
                ours.records
                    .values()
                    .any(|own| own.conflicts_with(candidate))
            })
            .cloned()
            .collect()
    }
}

impl PartialEq for RecordCollection {
    fn eq(&self, other: &Self) -> bool {
        self.records.len() == other.records.len()
            && self
                .records
                .keys()
                .all(|hash| other.records.contains_key(hash))
    }
}

impl Eq for RecordCollection {}

impl FromIterator<Record> for RecordCollection {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        let mut collection = RecordCollection::new();
        collection.add_each(iter);
        collection
    }
}

#[cfg(test)]
mod tests {
    use super::RecordCollection;
    use lancast_proto::packet::record::Record;
    use std::net::Ipv4Addr;

    fn a(last: u8) -> Record {
        Record::a("host.local.", Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn should_deduplicate_on_add() {
        let mut collection = RecordCollection::new();
        collection.add(a(1));
        collection.add(a(1));
        assert_eq!(collection.size(), 1);

        collection.add(a(2));
        assert_eq!(collection.size(), 2);
    }

    #[test]
    fn should_compute_set_algebra() {
        let left: RecordCollection = [a(1), a(2)].into_iter().collect();
        let right: RecordCollection = [a(2), a(3)].into_iter().collect();

        let both = left.intersection(&right);
        assert_eq!(both.size(), 1);
        assert!(both.has(&a(2)));

        let only_left = left.difference(&right);
        assert_eq!(only_left.size(), 1);
        assert!(only_left.has(&a(1)));

        assert_eq!(left, left.clone());
        assert_ne!(left, right);
    }

    #[test]
    fn should_ignore_shared_records_in_conflicts() {
        let ours: RecordCollection = [a(1)].into_iter().collect();
        let same: RecordCollection = [a(1)].into_iter().collect();
        assert!(ours.get_conflicts(&same).is_empty());

        let theirs: RecordCollection = [a(1), a(9)].into_iter().collect();
        // a(1) is shared, a(9) conflicts with nothing left on our side.
        assert!(ours.get_conflicts(&theirs).is_empty());
    }

    #[test]
    fn should_detect_real_conflicts() {
        let ours: RecordCollection = [a(1)].into_iter().collect();
        let theirs: RecordCollection = [a(2)].into_iter().collect();
        let conflicts = ours.get_conflicts(&theirs);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0], a(2));
    }
}
