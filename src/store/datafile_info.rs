/// Accounting for one datafile: how many markers are still referenced
/// by the primary index (alive), how many were superseded by a newer
/// revision or a deletion (dead), and how many deletion markers the
/// file holds. Byte totals count body bytes only, the fixed marker
/// prefixes are excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatafileInfo {
    pub fid: u64,
    pub number_alive: u64,
    pub size_alive: u64,
    pub number_dead: u64,
    pub size_dead: u64,
    pub number_deletion: u64,
}

impl DatafileInfo {
    pub fn new(fid: u64) -> Self {
        DatafileInfo {
            fid,
            number_alive: 0,
            size_alive: 0,
            number_dead: 0,
            size_dead: 0,
            number_deletion: 0,
        }
    }

    pub fn add_alive(&mut self, body_size: u64) {
        self.number_alive += 1;
        self.size_alive += body_size;
    }

    pub fn add_dead(&mut self, body_size: u64) {
        self.number_dead += 1;
        self.size_dead += body_size;
    }

    /// A live marker in this file was superseded by a newer revision or
    /// a deletion.
    pub fn supersede(&mut self, body_size: u64) {
        self.number_alive = self.number_alive.saturating_sub(1);
        self.size_alive = self.size_alive.saturating_sub(body_size);
        self.number_dead += 1;
        self.size_dead += body_size;
    }

    pub fn add_deletion(&mut self) {
        self.number_deletion += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supersede_moves_alive_to_dead() {
        let mut info = DatafileInfo::new(1);
        info.add_alive(100);
        info.add_alive(50);
        info.supersede(100);

        assert_eq!(info.number_alive, 1);
        assert_eq!(info.size_alive, 50);
        assert_eq!(info.number_dead, 1);
        assert_eq!(info.size_dead, 100);
    }
}
