//! Parallel tet-to-tet face adjacency, the worked example of driving the
//! scheduler over irregular data.
//!
//! Phase one fills one private face hash table per worker and links the
//! faces whose two tets were claimed by the same worker; phase two
//! stitches the remaining faces by probing the other tables. The tet
//! family has no dependency links, so both launches run as a single color
//! class, and all writes stay lock-free because each worker only touches
//! adjacency and flag cells of tets it claimed itself.

use std::marker::PhantomData;

use crossbeam_utils::CachePadded;

use crate::family::FamilyId;
use crate::mesh::{Mesh, Triangle};
use crate::scheduler::{Error, Scheduler};
use crate::work::PacketRunner;

/// Vertices of the face opposite each tet corner, outward oriented.
pub const FACE_VERTICES: [[usize; 3]; 4] = [[1, 2, 3], [2, 0, 3], [3, 0, 1], [0, 2, 1]];

/// Tet-to-tet adjacency. `of(t)[f]` is the 1-based id of the tet sharing
/// face `f` of tet `t`, or 0 when the face lies on the boundary.
#[derive(Debug, PartialEq, Eq)]
pub struct Adjacency {
    rows: Vec<[u32; 4]>,
}

impl Adjacency {
    #[inline]
    pub fn of(&self, tet: usize) -> &[u32; 4] {
        &self.rows[tet - 1]
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One stored face: the owning tet, the position of the opposite vertex,
/// the positions of the sorted face vertices, and the chain link.
///
/// `tet == 0` marks an empty primary bucket and `next == 0` the end of a
/// chain; slot 0 is always a primary bucket, never an overflow slot, so
/// the two sentinels cannot collide.
#[derive(Copy, Clone, Default)]
struct FaceSlot {
    tet: u32,
    next: u32,
    opposite: u8,
    min: u8,
    mid: u8,
    max: u8,
}

struct FaceTable {
    slots: Vec<FaceSlot>,
}

impl FaceTable {
    fn with_buckets(primary: usize) -> FaceTable {
        let mut slots = Vec::with_capacity(5 * primary);
        slots.resize(primary, FaceSlot::default());
        FaceTable { slots }
    }
}

/// Sorted positions (min, mid, max) of the face opposite `opposite`,
/// comparing the vertex ids. The middle position is recovered as
/// `6 - min - max - opposite` since the four positions sum to 6.
#[inline]
fn canonical_face(vertices: &[u32; 4], opposite: usize) -> [usize; 3] {
    let mut min = (opposite + 1) % 4;
    let mut max = min;

    for k in 0..4 {
        if k == opposite {
            continue;
        }
        if vertices[k] < vertices[min] {
            min = k;
        } else if vertices[k] > vertices[max] {
            max = k;
        }
    }

    [min, 6 - min - max - opposite, max]
}

#[inline]
fn face_key(vertices: &[u32; 4], face: [usize; 3], mask: u64) -> usize {
    let key = 31 * vertices[face[0]] as u64 + 7 * vertices[face[1]] as u64
        + 3 * vertices[face[2]] as u64;
    (key & mask) as usize
}

/// Hands each worker mutable access to disjoint cells of a shared slice.
///
/// Unsafe: soundness rests on the dispatch discipline; the comment at each
/// use states the disjointness argument.
struct SharedCells<'a, T> {
    ptr: *mut T,
    len: usize,
    _lifetime: PhantomData<&'a mut [T]>,
}

unsafe impl<T: Send> Sync for SharedCells<'_, T> {}

impl<'a, T> SharedCells<'a, T> {
    fn new(cells: &'a mut [T]) -> SharedCells<'a, T> {
        SharedCells {
            ptr: cells.as_mut_ptr(),
            len: cells.len(),
            _lifetime: PhantomData,
        }
    }

    /// Unsafe: the caller asserts that no other thread reads or writes
    /// cell `i` while the returned borrow is alive.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn get_mut(&self, i: usize) -> &mut T {
        debug_assert!(i < self.len);
        &mut *self.ptr.add(i)
    }
}

/// Phase one: hash every face of the claimed tets into this worker's
/// private table, linking both sides when the same face shows up twice.
struct LocalLink<'a> {
    mesh: &'a Mesh,
    mask: u64,
    /// One private table per worker.
    tables: SharedCells<'a, CachePadded<FaceTable>>,
    /// Adjacency rows, indexed by tet id - 1.
    neighbours: SharedCells<'a, [u32; 4]>,
    /// Per-tet matched-face count, 0..4, to short-circuit phase two.
    flags: SharedCells<'a, u8>,
}

impl PacketRunner for LocalLink<'_> {
    fn run(&self, begin: usize, end: usize, worker: usize) {
        // Disjointness: the table is private to `worker`, and every
        // adjacency or flag cell written below belongs either to a tet of
        // this packet or to a tet stored in this worker's own table, and
        // stored tets were claimed by this worker earlier in the same
        // launch. Workers never touch each other's cells.
        let table = unsafe { self.tables.get_mut(worker) };

        for i in begin..=end {
            let tet = self.mesh.tet(i);

            for face in 0..4 {
                let pos = canonical_face(&tet.vertices, face);
                let key = face_key(&tet.vertices, pos, self.mask);

                if table.slots[key].tet == 0 {
                    table.slots[key] = FaceSlot {
                        tet: i as u32,
                        next: 0,
                        opposite: face as u8,
                        min: pos[0] as u8,
                        mid: pos[1] as u8,
                        max: pos[2] as u8,
                    };
                    continue;
                }

                let mut slot = key;
                loop {
                    let entry = table.slots[slot];
                    let other = self.mesh.tet(entry.tet as usize);

                    if other.vertices[entry.min as usize] == tet.vertices[pos[0]]
                        && other.vertices[entry.mid as usize] == tet.vertices[pos[1]]
                        && other.vertices[entry.max as usize] == tet.vertices[pos[2]]
                    {
                        // Same face: link both sides.
                        unsafe {
                            self.neighbours.get_mut(i - 1)[face] = entry.tet;
                            *self.flags.get_mut(i - 1) += 1;
                            self.neighbours.get_mut(entry.tet as usize - 1)
                                [entry.opposite as usize] = i as u32;
                            *self.flags.get_mut(entry.tet as usize - 1) += 1;
                        }
                        break;
                    }

                    if entry.next != 0 {
                        slot = entry.next as usize;
                    } else {
                        // Chain end: append an overflow slot.
                        let overflow = table.slots.len() as u32;
                        table.slots.push(FaceSlot {
                            tet: i as u32,
                            next: 0,
                            opposite: face as u8,
                            min: pos[0] as u8,
                            mid: pos[1] as u8,
                            max: pos[2] as u8,
                        });
                        table.slots[slot].next = overflow;
                        break;
                    }
                }
            }
        }
    }
}

/// Phase two: for each face still unmatched, probe every table at the
/// same key. The tables are frozen since phase one completed.
struct CrossLink<'a> {
    mesh: &'a Mesh,
    mask: u64,
    tables: &'a [CachePadded<FaceTable>],
    neighbours: SharedCells<'a, [u32; 4]>,
    flags: &'a [u8],
}

impl PacketRunner for CrossLink<'_> {
    fn run(&self, begin: usize, end: usize, _worker: usize) {
        for i in begin..=end {
            // Fully matched in phase one.
            if self.flags[i - 1] == 4 {
                continue;
            }

            let tet = self.mesh.tet(i);

            'faces: for face in 0..4 {
                // Disjointness: only this packet's rows are written; rows
                // of other tets are never read here.
                let row = unsafe { self.neighbours.get_mut(i - 1) };
                if row[face] != 0 {
                    continue;
                }

                let pos = canonical_face(&tet.vertices, face);
                let key = face_key(&tet.vertices, pos, self.mask);

                for table in self.tables {
                    let mut slot = key;
                    loop {
                        let entry = table.slots[slot];

                        // `tet == i` is this face's own phase-one entry;
                        // skipping it (rather than whole tables) is what
                        // keeps the probe correct when one worker claimed
                        // several packets.
                        if entry.tet != 0 && entry.tet != i as u32 {
                            let other = self.mesh.tet(entry.tet as usize);
                            if other.vertices[entry.min as usize] == tet.vertices[pos[0]]
                                && other.vertices[entry.mid as usize] == tet.vertices[pos[1]]
                                && other.vertices[entry.max as usize] == tet.vertices[pos[2]]
                            {
                                row[face] = entry.tet;
                                continue 'faces;
                            }
                        }

                        if entry.next == 0 {
                            break;
                        }
                        slot = entry.next as usize;
                    }
                }
            }
        }
    }
}

/// Build the tet-to-tet adjacency of `mesh` with two launches over `tets`
/// (a family registered with cardinality `mesh.tets.len()`).
pub fn tet_neighbours(
    scheduler: &mut Scheduler,
    tets: FamilyId,
    mesh: &Mesh,
) -> Result<Adjacency, Error> {
    let count = mesh.tets.len();
    if count == 0 {
        return Ok(Adjacency { rows: Vec::new() });
    }

    let workers = scheduler.num_workers();

    // Smallest power of two >= 2 * tets-per-worker; the bit mask is the
    // modulus, and the same key addresses every worker's table.
    let bits = (1.0 + 2.0 * count as f64 / workers as f64).log2().ceil() as u32;
    let primary = 1usize << bits;
    let mask = (primary - 1) as u64;

    let mut rows = vec![[0u32; 4]; count];
    let mut flags = vec![0u8; count];
    let mut tables: Vec<CachePadded<FaceTable>> = (0..workers)
        .map(|_| CachePadded::new(FaceTable::with_buckets(primary)))
        .collect();

    let local = LocalLink {
        mesh,
        mask,
        tables: SharedCells::new(&mut tables),
        neighbours: SharedCells::new(&mut rows),
        flags: SharedCells::new(&mut flags),
    };
    scheduler.launch(tets, &local)?;
    drop(local);

    if workers > 1 {
        let cross = CrossLink {
            mesh,
            mask,
            tables: &tables,
            neighbours: SharedCells::new(&mut rows),
            flags: &flags,
        };
        scheduler.launch(tets, &cross)?;
    }

    Ok(Adjacency { rows })
}

/// Emit the boundary: faces with no neighbour (reference 0) and faces
/// between tets of differing references (reference 1). The strict
/// `i > neighbour` test keeps each interface face once, on the side of
/// the larger tet id.
pub fn boundary_triangles(mesh: &Mesh, adjacency: &Adjacency) -> Vec<Triangle> {
    let mut triangles = Vec::new();

    for i in 1..=mesh.tets.len() {
        let tet = mesh.tet(i);

        for face in 0..4 {
            let ngb = adjacency.of(i)[face];
            let external = ngb == 0;
            let interface =
                !external && mesh.tet(ngb as usize).tag != tet.tag && i as u32 > ngb;

            if external || interface {
                triangles.push(Triangle {
                    vertices: [
                        tet.vertices[FACE_VERTICES[face][0]],
                        tet.vertices[FACE_VERTICES[face][1]],
                        tet.vertices[FACE_VERTICES[face][2]],
                    ],
                    tag: if external { 0 } else { 1 },
                });
            }
        }
    }

    triangles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{Tetrahedron, Vertex};

    fn mesh_with_tets(num_vertices: usize, tets: &[([u32; 4], i32)]) -> Mesh {
        Mesh {
            version: 2,
            vertices: (0..num_vertices)
                .map(|i| Vertex {
                    coords: [i as f64, 0.0, 0.0],
                    tag: 0,
                })
                .collect(),
            triangles: Vec::new(),
            tets: tets
                .iter()
                .map(|&(vertices, tag)| Tetrahedron { vertices, tag })
                .collect(),
        }
    }

    fn run(mesh: &Mesh, workers: usize) -> (Adjacency, Vec<Triangle>) {
        let mut scheduler = Scheduler::new(workers);
        scheduler.register_family(mesh.vertices.len());
        let tets = scheduler.register_family(mesh.tets.len());
        let adjacency = tet_neighbours(&mut scheduler, tets, mesh).unwrap();
        let triangles = boundary_triangles(mesh, &adjacency);
        (adjacency, triangles)
    }

    #[test]
    fn single_tet_has_four_external_faces() {
        let mesh = mesh_with_tets(4, &[([1, 2, 3, 4], 0)]);
        let (adjacency, triangles) = run(&mesh, 2);

        assert_eq!(adjacency.of(1), &[0, 0, 0, 0]);
        assert_eq!(triangles.len(), 4);

        let expected = [[2, 3, 4], [3, 1, 4], [4, 1, 2], [1, 3, 2]];
        for (triangle, vertices) in triangles.iter().zip(expected) {
            assert_eq!(triangle.vertices, vertices);
            assert_eq!(triangle.tag, 0);
        }
    }

    #[test]
    fn two_tets_share_a_face() {
        let mesh = mesh_with_tets(5, &[([1, 2, 3, 4], 0), ([1, 2, 3, 5], 0)]);
        let (adjacency, triangles) = run(&mesh, 2);

        // The shared face (1,2,3) is opposite position 3 in both tets.
        assert_eq!(adjacency.of(1), &[0, 0, 0, 2]);
        assert_eq!(adjacency.of(2), &[0, 0, 0, 1]);
        assert_eq!(triangles.len(), 6);
        assert!(triangles.iter().all(|t| t.tag == 0));
    }

    #[test]
    fn material_interface_is_emitted_once() {
        let mesh = mesh_with_tets(5, &[([1, 2, 3, 4], 1), ([1, 2, 3, 5], 2)]);
        let (adjacency, triangles) = run(&mesh, 2);

        assert_eq!(adjacency.of(1)[3], 2);
        assert_eq!(adjacency.of(2)[3], 1);

        assert_eq!(triangles.len(), 7);
        let interface: Vec<_> = triangles.iter().filter(|t| t.tag == 1).collect();
        assert_eq!(interface.len(), 1);
        // Kept by the larger tet id: face 3 of tet 2.
        assert_eq!(interface[0].vertices, [1, 3, 2]);
    }

    #[test]
    fn kuhn_cube_has_twelve_boundary_triangles() {
        // The six tets walk the axis permutations of the main diagonal.
        let tets: Vec<([u32; 4], i32)> = [
            [1u32, 2, 4, 8],
            [1, 2, 6, 8],
            [1, 3, 4, 8],
            [1, 3, 7, 8],
            [1, 5, 6, 8],
            [1, 5, 7, 8],
        ]
        .iter()
        .map(|&vertices| (vertices, 0))
        .collect();
        let mesh = mesh_with_tets(8, &tets);
        let (adjacency, triangles) = run(&mesh, 3);

        assert_eq!(triangles.len(), 12);
        assert!(triangles.iter().all(|t| t.tag == 0));

        // Interior faces come in matched pairs.
        let matched: usize = (1..=6)
            .map(|i| adjacency.of(i).iter().filter(|&&n| n != 0).count())
            .sum();
        assert_eq!(matched, 12);
    }

    #[test]
    fn adjacency_is_symmetric() {
        let tets: Vec<([u32; 4], i32)> = [
            [1u32, 2, 4, 8],
            [1, 2, 6, 8],
            [1, 3, 4, 8],
            [1, 3, 7, 8],
            [1, 5, 6, 8],
            [1, 5, 7, 8],
        ]
        .iter()
        .map(|&vertices| (vertices, 0))
        .collect();
        let mesh = mesh_with_tets(8, &tets);
        let (adjacency, _) = run(&mesh, 4);

        for i in 1..=mesh.tets.len() {
            for face in 0..4 {
                let m = adjacency.of(i)[face];
                if m == 0 {
                    continue;
                }

                let back: Vec<usize> = (0..4)
                    .filter(|&f| adjacency.of(m as usize)[f] == i as u32)
                    .collect();
                assert_eq!(back.len(), 1);

                // Same canonical vertex triple on both sides.
                let pos = canonical_face(&mesh.tet(i).vertices, face);
                let ours: Vec<u32> = pos.iter().map(|&p| mesh.tet(i).vertices[p]).collect();
                let pos = canonical_face(&mesh.tet(m as usize).vertices, back[0]);
                let theirs: Vec<u32> =
                    pos.iter().map(|&p| mesh.tet(m as usize).vertices[p]).collect();
                assert_eq!(ours, theirs);
            }
        }
    }

    #[test]
    fn empty_mesh_yields_empty_adjacency() {
        let mesh = mesh_with_tets(4, &[]);
        let (adjacency, triangles) = run(&mesh, 2);
        assert!(adjacency.is_empty());
        assert!(triangles.is_empty());
    }

    #[test]
    fn canonical_face_sorts_by_vertex_id() {
        let vertices = [40u32, 10, 30, 20];
        // Face opposite position 0 holds vertices 10, 30, 20.
        assert_eq!(canonical_face(&vertices, 0), [1, 3, 2]);
        // Face opposite position 1 holds vertices 40, 30, 20.
        assert_eq!(canonical_face(&vertices, 1), [3, 2, 0]);
    }
}
