//! Mesh collaborator: the container shared by the driver and the
//! neighbours algorithm, with a reader and writer for the Medit ASCII
//! dialect (`MeshVersionFormatted`, `Dimension`, `Vertices`, `Triangles`,
//! `Tetrahedra`, `End`; `#` starts a comment).

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Cannot open mesh {}: {}", .path.display(), .source)]
    Open { path: PathBuf, source: io::Error },
    #[error("Cannot create mesh {}: {}", .path.display(), .source)]
    Create { path: PathBuf, source: io::Error },
    #[error("Can only handle 3D meshes (dimension = {0})")]
    NotThreeDimensional(i64),
    #[error("Mesh has no vertices")]
    NoVertices,
    #[error("Invalid mesh file: {0}")]
    Parse(String),
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Vertex {
    pub coords: [f64; 3],
    pub tag: i32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Triangle {
    pub vertices: [u32; 3],
    pub tag: i32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Tetrahedron {
    pub vertices: [u32; 4],
    pub tag: i32,
}

/// A volume mesh. Entity ids are 1-based in every public contract; the
/// backing vectors are 0-based, so the accessors subtract one.
#[derive(Debug, Default, PartialEq)]
pub struct Mesh {
    pub version: u32,
    pub vertices: Vec<Vertex>,
    pub triangles: Vec<Triangle>,
    pub tets: Vec<Tetrahedron>,
}

impl Mesh {
    #[inline]
    pub fn vertex(&self, id: usize) -> &Vertex {
        &self.vertices[id - 1]
    }

    #[inline]
    pub fn tet(&self, id: usize) -> &Tetrahedron {
        &self.tets[id - 1]
    }

    /// Read a mesh file, requiring dimension 3 and at least one vertex.
    pub fn read(path: &Path) -> Result<Mesh, MeshError> {
        let text = fs::read_to_string(path).map_err(|source| MeshError::Open {
            path: path.to_owned(),
            source,
        })?;
        Mesh::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Mesh, MeshError> {
        let mut tokens = text
            .lines()
            .map(|line| line.split('#').next().unwrap_or(""))
            .flat_map(str::split_whitespace);

        let mut mesh = Mesh {
            version: 1,
            ..Mesh::default()
        };
        let mut dimension = None;

        while let Some(keyword) = tokens.next() {
            match keyword {
                "MeshVersionFormatted" => {
                    mesh.version = next_number(&mut tokens, keyword)?;
                }
                "Dimension" => {
                    dimension = Some(next_number::<i64, _>(&mut tokens, keyword)?);
                }
                "Vertices" => {
                    let count: usize = next_number(&mut tokens, keyword)?;
                    mesh.vertices.reserve(count);
                    for _ in 0..count {
                        mesh.vertices.push(Vertex {
                            coords: [
                                next_number(&mut tokens, "vertex")?,
                                next_number(&mut tokens, "vertex")?,
                                next_number(&mut tokens, "vertex")?,
                            ],
                            tag: next_number(&mut tokens, "vertex")?,
                        });
                    }
                }
                "Triangles" => {
                    let count: usize = next_number(&mut tokens, keyword)?;
                    mesh.triangles.reserve(count);
                    for _ in 0..count {
                        mesh.triangles.push(Triangle {
                            vertices: [
                                next_number(&mut tokens, "triangle")?,
                                next_number(&mut tokens, "triangle")?,
                                next_number(&mut tokens, "triangle")?,
                            ],
                            tag: next_number(&mut tokens, "triangle")?,
                        });
                    }
                }
                "Tetrahedra" => {
                    let count: usize = next_number(&mut tokens, keyword)?;
                    mesh.tets.reserve(count);
                    for _ in 0..count {
                        mesh.tets.push(Tetrahedron {
                            vertices: [
                                next_number(&mut tokens, "tetrahedron")?,
                                next_number(&mut tokens, "tetrahedron")?,
                                next_number(&mut tokens, "tetrahedron")?,
                                next_number(&mut tokens, "tetrahedron")?,
                            ],
                            tag: next_number(&mut tokens, "tetrahedron")?,
                        });
                    }
                }
                "End" => break,
                other => {
                    return Err(MeshError::Parse(format!("unsupported keyword {:?}", other)));
                }
            }
        }

        match dimension {
            Some(3) => {}
            Some(d) => return Err(MeshError::NotThreeDimensional(d)),
            None => return Err(MeshError::Parse("missing Dimension".into())),
        }

        if mesh.vertices.is_empty() {
            return Err(MeshError::NoVertices);
        }

        Ok(mesh)
    }

    /// Write in the same dialect, keyword order Vertices, Triangles,
    /// Tetrahedra, matching the historical tool chain.
    pub fn write(&self, path: &Path) -> Result<(), MeshError> {
        let file = fs::File::create(path).map_err(|source| MeshError::Create {
            path: path.to_owned(),
            source,
        })?;

        let mut out = BufWriter::new(file);
        self.write_to(&mut out).map_err(|source| MeshError::Create {
            path: path.to_owned(),
            source,
        })
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "MeshVersionFormatted {}", self.version)?;
        writeln!(out, "Dimension 3")?;

        writeln!(out, "\nVertices\n{}", self.vertices.len())?;
        for vertex in &self.vertices {
            writeln!(
                out,
                "{} {} {} {}",
                vertex.coords[0], vertex.coords[1], vertex.coords[2], vertex.tag
            )?;
        }

        if !self.triangles.is_empty() {
            writeln!(out, "\nTriangles\n{}", self.triangles.len())?;
            for triangle in &self.triangles {
                writeln!(
                    out,
                    "{} {} {} {}",
                    triangle.vertices[0], triangle.vertices[1], triangle.vertices[2], triangle.tag
                )?;
            }
        }

        if !self.tets.is_empty() {
            writeln!(out, "\nTetrahedra\n{}", self.tets.len())?;
            for tet in &self.tets {
                writeln!(
                    out,
                    "{} {} {} {} {}",
                    tet.vertices[0], tet.vertices[1], tet.vertices[2], tet.vertices[3], tet.tag
                )?;
            }
        }

        writeln!(out, "\nEnd")
    }
}

fn next_number<'a, T, I>(tokens: &mut I, what: &str) -> Result<T, MeshError>
where
    T: std::str::FromStr,
    I: Iterator<Item = &'a str>,
{
    let token = tokens
        .next()
        .ok_or_else(|| MeshError::Parse(format!("unexpected end of file in {}", what)))?;
    token
        .parse()
        .map_err(|_| MeshError::Parse(format!("bad number {:?} in {}", token, what)))
}
