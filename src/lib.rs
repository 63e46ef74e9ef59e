//! A shared-memory parallel loop scheduler for unstructured-mesh
//! computations.
//!
//! The caller registers *families* (sized index spaces such as "all
//! vertices" or "all tetrahedra"), optionally declares that loops over one
//! family write cells of another through an indirection, and then launches
//! a per-packet function over a family. The scheduler:
//!
//! - splits each family into contiguous packets for cache locality,
//! - colors the packets so that two packets running concurrently never
//!   write the same cell of any dependent family,
//! - drives a fixed pool of workers through the color classes, with a
//!   barrier between classes.
//!
//! The coloring discipline is what lets user code write through
//! indirections without any locking. The [`neighbours`] module shows the
//! intended use on a genuinely irregular problem: building tet-to-tet face
//! adjacency with per-worker hash tables.

mod coloring;
mod family;
mod links;
mod pool;
mod scheduler;
mod time;
mod work;

pub mod mesh;
pub mod neighbours;

pub use family::FamilyId;
pub use links::Observer;
pub use scheduler::{Error, Scheduler, MAX_WORKERS};
pub use time::wall_clock;
pub use work::{Packet, PacketRunner};
