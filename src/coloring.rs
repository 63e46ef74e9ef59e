//! Groups the packets of one family into classes whose members never
//! write the same cell of any dependent family.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use crate::links::Observer;
use crate::work::Packet;

/// Greedy coloring of one family's packets against its outgoing links.
///
/// Deterministic for fixed inputs: packets are visited by descending
/// conflict degree (ties by ascending packet index) and each takes the
/// smallest color unused by its already-colored conflicts. Classes are
/// returned with their packet indices sorted ascending. With no observers
/// every packet lands in a single class.
pub(crate) fn color_packets(packets: &[Packet], observers: &[&dyn Observer]) -> Vec<Vec<u32>> {
    profiling::scope!("color_packets");

    if packets.is_empty() {
        return Vec::new();
    }

    if observers.is_empty() {
        return vec![(0..packets.len() as u32).collect()];
    }

    let conflicts = conflict_sets(packets, observers);

    let mut order: Vec<u32> = (0..packets.len() as u32).collect();
    order.sort_by_key(|&p| (Reverse(conflicts[p as usize].len()), p));

    let mut color = vec![u32::MAX; packets.len()];
    let mut classes: Vec<Vec<u32>> = Vec::new();
    let mut in_use = Vec::new();

    for &p in &order {
        // One extra slot so a free color always exists.
        in_use.clear();
        in_use.resize(classes.len() + 1, false);

        for &q in &conflicts[p as usize] {
            let c = color[q as usize];
            if c != u32::MAX {
                in_use[c as usize] = true;
            }
        }

        let c = in_use.iter().position(|used| !used).unwrap() as u32;
        color[p as usize] = c;
        if c as usize == classes.len() {
            classes.push(Vec::new());
        }
        classes[c as usize].push(p);
    }

    for class in &mut classes {
        class.sort_unstable();
    }

    classes
}

/// For every link, bucket touched target indices to the packets touching
/// them; packets sharing any bucket conflict. Only membership of the
/// resulting sets matters, so hash iteration order cannot leak into the
/// coloring.
fn conflict_sets(packets: &[Packet], observers: &[&dyn Observer]) -> Vec<HashSet<u32>> {
    let mut conflicts: Vec<HashSet<u32>> = vec![HashSet::new(); packets.len()];
    let mut touched = Vec::new();

    for observer in observers {
        let mut writers: HashMap<usize, Vec<u32>> = HashMap::new();

        for (p, packet) in packets.iter().enumerate() {
            touched.clear();
            observer.observe(*packet, &mut touched);
            touched.sort_unstable();
            touched.dedup();

            for &cell in &touched {
                writers.entry(cell).or_default().push(p as u32);
            }
        }

        for owners in writers.values() {
            if owners.len() < 2 {
                continue;
            }

            for &a in owners {
                for &b in owners {
                    if a != b {
                        conflicts[a as usize].insert(b);
                    }
                }
            }
        }
    }

    conflicts
}
