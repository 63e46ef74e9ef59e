//! Extract the boundary surface of a volume-only tetrahedral mesh.
//!
//! Reads a tet mesh, builds the tet-to-tet adjacency in parallel, emits
//! one triangle per external or material-interface face, and writes the
//! mesh back with the triangles attached.

use std::path::PathBuf;
use std::process::exit;

use parloop::mesh::Mesh;
use parloop::neighbours::{boundary_triangles, tet_neighbours};
use parloop::{wall_clock, Scheduler, MAX_WORKERS};

fn usage() {
    println!();
    println!("tetrahedra_neighbours: extract a surface mesh from a volume-only tetrahedral mesh");
    println!(" Usage      : tetrahedra_neighbours -in volume_mesh -out surface_mesh");
    println!(" -in name   : name of the input tetrahedral-only mesh");
    println!(" -out name  : name of the output surface mesh");
    println!(" -nproc n   : number of worker threads (default = all available threads)");
    println!();
}

/// Names given without a `.mesh` suffix get `.meshb` appended.
fn mesh_path(name: &str) -> PathBuf {
    if name.contains(".mesh") {
        PathBuf::from(name)
    } else {
        PathBuf::from(format!("{}.meshb", name))
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() == 1 {
        usage();
        return;
    }

    let mut input = None;
    let mut output = None;
    let mut workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-in" if i + 1 < args.len() => {
                input = Some(mesh_path(&args[i + 1]));
                i += 2;
            }
            "-out" if i + 1 < args.len() => {
                output = Some(mesh_path(&args[i + 1]));
                i += 2;
            }
            "-nproc" if i + 1 < args.len() => {
                workers = match args[i + 1].parse::<usize>() {
                    Ok(n) => n.clamp(1, MAX_WORKERS),
                    Err(_) => {
                        println!("Bad thread count {:?}", args[i + 1]);
                        exit(1);
                    }
                };
                i += 2;
            }
            other => {
                println!("Unknown or incomplete argument {:?}", other);
                exit(1);
            }
        }
    }

    let Some(input) = input else {
        println!("No input mesh provided");
        exit(1);
    };
    let Some(output) = output else {
        println!("No output name provided");
        exit(1);
    };

    // Mesh reading.
    let start = wall_clock();
    let mut mesh = match Mesh::read(&input) {
        Ok(mesh) => mesh,
        Err(err) => {
            println!("{}", err);
            exit(1);
        }
    };
    println!("\nReading mesh        : {:.6} s", wall_clock() - start);
    println!(
        "Input mesh          : version = {}, vertices = {}, tets = {}",
        mesh.version,
        mesh.vertices.len(),
        mesh.tets.len()
    );

    let mut scheduler = Scheduler::new(workers);
    scheduler.register_family(mesh.vertices.len());
    let tets = scheduler.register_family(mesh.tets.len());

    // Parallel neighbours, then the serial boundary pass.
    let start = wall_clock();
    let adjacency = match tet_neighbours(&mut scheduler, tets, &mesh) {
        Ok(adjacency) => adjacency,
        Err(err) => {
            println!("{}", err);
            exit(1);
        }
    };
    println!("Tet neighbours      : {:.6} s", wall_clock() - start);

    let triangles = boundary_triangles(&mesh, &adjacency);
    println!("Boundary extraction : {} triangles", triangles.len());
    mesh.triangles = triangles;

    // Mesh writing.
    let start = wall_clock();
    if let Err(err) = mesh.write(&output) {
        println!("{}", err);
        exit(1);
    }
    println!("Writing mesh        : {:.6} s\n", wall_clock() - start);
}
