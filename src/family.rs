use crate::work::Packet;

/// Packets per worker aimed for by the partitioner; more packets than
/// workers gives the coloring engine room to spread conflicts.
const PACKETS_PER_WORKER: usize = 4;

/// Identifies a registered entity family (vertices, edges, tets, ...).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FamilyId(pub(crate) u32);

/// Registry entry for one entity family.
pub(crate) struct Family {
    pub cardinality: usize,
    pub packets: Vec<Packet>,
    /// `colors[c]` lists the packet indices of color class `c`, ascending.
    pub colors: Vec<Vec<u32>>,
    /// Set when the packet table or the outgoing links changed since
    /// `colors` was computed; the next launch recolors lazily.
    pub dirty: bool,
}

impl Family {
    pub fn new(cardinality: usize, num_workers: usize) -> Family {
        Family {
            cardinality,
            packets: partition(cardinality, num_workers),
            colors: Vec::new(),
            dirty: true,
        }
    }

    pub fn resize(&mut self, cardinality: usize, num_workers: usize) {
        self.cardinality = cardinality;
        self.packets = partition(cardinality, num_workers);
        self.colors.clear();
        self.dirty = true;
    }
}

/// Split `[1..=cardinality]` into contiguous packets of
/// `max(1, ceil(cardinality / (4 * num_workers)))` indices, the last one
/// possibly shorter. Deterministic in (cardinality, num_workers).
pub(crate) fn partition(cardinality: usize, num_workers: usize) -> Vec<Packet> {
    if cardinality == 0 {
        return Vec::new();
    }

    let target = PACKETS_PER_WORKER * num_workers;
    let size = ((cardinality + target - 1) / target).max(1);

    let mut packets = Vec::with_capacity((cardinality + size - 1) / size);
    let mut begin = 1;
    while begin <= cardinality {
        let end = (begin + size - 1).min(cardinality);
        packets.push(Packet { begin, end });
        begin = end + 1;
    }

    packets
}
