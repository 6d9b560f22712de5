//! Geohash codec: base-32, interleaved-bits Peano encoding of
//! (latitude, longitude) cells, plus same-precision neighbor walks.
//!
//! Encoding interleaves longitude and latitude bisections starting with
//! longitude, packing five bits per base-32 character. Decoding returns
//! the cell center together with the half-width of the cell on each
//! axis, so the true point is always within the returned error bounds.

use super::GeoError;

/// The geohash base-32 alphabet (no `a`, `i`, `l`, `o`).
const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Compass direction for neighbor walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

// Adjacency tables from the canonical geohash neighbor algorithm. The
// `even`/`odd` split follows the parity of the hash length, because the
// interleave axis alternates per character.
struct Adjacency {
    neighbor_even: &'static [u8; 32],
    neighbor_odd: &'static [u8; 32],
    border_even: &'static [u8],
    border_odd: &'static [u8],
}

const NORTH: Adjacency = Adjacency {
    neighbor_even: b"p0r21436x8zb9dcf5h7kjnmqesgutwvy",
    neighbor_odd: b"bc01fg45238967deuvhjyznpkmstqrwx",
    border_even: b"prxz",
    border_odd: b"bcfguvyz",
};
const SOUTH: Adjacency = Adjacency {
    neighbor_even: b"14365h7k9dcfesgujnmqp0r2twvyx8zb",
    neighbor_odd: b"238967debc01fg45kmstqrwxuvhjyznp",
    border_even: b"028b",
    border_odd: b"0145hjnp",
};
const EAST: Adjacency = Adjacency {
    neighbor_even: b"bc01fg45238967deuvhjyznpkmstqrwx",
    neighbor_odd: b"p0r21436x8zb9dcf5h7kjnmqesgutwvy",
    border_even: b"bcfguvyz",
    border_odd: b"prxz",
};
const WEST: Adjacency = Adjacency {
    neighbor_even: b"238967debc01fg45kmstqrwxuvhjyznp",
    neighbor_odd: b"14365h7k9dcfesgujnmqp0r2twvyx8zb",
    border_even: b"0145hjnp",
    border_odd: b"028b",
};

fn adjacency(direction: Direction) -> &'static Adjacency {
    match direction {
        Direction::North => &NORTH,
        Direction::South => &SOUTH,
        Direction::East => &EAST,
        Direction::West => &WEST,
    }
}

/// A decoded geohash cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedCell {
    /// Cell center latitude.
    pub lat: f64,
    /// Cell center longitude.
    pub lng: f64,
    /// Half-height of the cell in degrees of latitude.
    pub lat_error: f64,
    /// Half-width of the cell in degrees of longitude.
    pub lng_error: f64,
}

/// Encodes a point to a geohash of the given precision (characters).
///
/// Coordinates are clamped to the valid WGS-84 ranges so boundary
/// inputs (`±90`, `±180`) encode to the edge cell instead of failing.
pub fn encode_geohash(lat: f64, lng: f64, precision: usize) -> String {
    let lat = lat.clamp(-90.0, 90.0);
    let lng = lng.clamp(-180.0, 180.0);

    let mut lat_range = (-90.0f64, 90.0f64);
    let mut lng_range = (-180.0f64, 180.0f64);
    let mut hash = String::with_capacity(precision);
    let mut even_bit = true; // longitude first
    let mut ch = 0usize;
    let mut bit = 0usize;

    while hash.len() < precision {
        if even_bit {
            let mid = (lng_range.0 + lng_range.1) / 2.0;
            if lng >= mid {
                ch = (ch << 1) | 1;
                lng_range.0 = mid;
            } else {
                ch <<= 1;
                lng_range.1 = mid;
            }
        } else {
            let mid = (lat_range.0 + lat_range.1) / 2.0;
            if lat >= mid {
                ch = (ch << 1) | 1;
                lat_range.0 = mid;
            } else {
                ch <<= 1;
                lat_range.1 = mid;
            }
        }
        even_bit = !even_bit;
        bit += 1;
        if bit == 5 {
            hash.push(BASE32[ch] as char);
            bit = 0;
            ch = 0;
        }
    }
    hash
}

/// Decodes a geohash to its cell center and per-axis error bounds.
pub fn decode_geohash(hash: &str) -> Result<DecodedCell, GeoError> {
    if hash.is_empty() {
        return Err(GeoError::EmptyGeohash);
    }

    let mut lat_range = (-90.0f64, 90.0f64);
    let mut lng_range = (-180.0f64, 180.0f64);
    let mut even_bit = true;

    for c in hash.chars() {
        let value = base32_index(c)?;
        for shift in (0..5).rev() {
            let bit = (value >> shift) & 1;
            if even_bit {
                let mid = (lng_range.0 + lng_range.1) / 2.0;
                if bit == 1 {
                    lng_range.0 = mid;
                } else {
                    lng_range.1 = mid;
                }
            } else {
                let mid = (lat_range.0 + lat_range.1) / 2.0;
                if bit == 1 {
                    lat_range.0 = mid;
                } else {
                    lat_range.1 = mid;
                }
            }
            even_bit = !even_bit;
        }
    }

    Ok(DecodedCell {
        lat: (lat_range.0 + lat_range.1) / 2.0,
        lng: (lng_range.0 + lng_range.1) / 2.0,
        lat_error: (lat_range.1 - lat_range.0) / 2.0,
        lng_error: (lng_range.1 - lng_range.0) / 2.0,
    })
}

/// Computes the adjacent cell at the same precision.
///
/// At the poles the walk may run out of cells; the result is then a
/// shorter (possibly empty) string rather than an error — callers treat
/// it as "no neighbor".
pub fn get_neighbor(hash: &str, direction: Direction) -> Result<String, GeoError> {
    if hash.is_empty() {
        return Ok(String::new());
    }
    // Validate up front so the recursion below only sees known-good input.
    for c in hash.chars() {
        base32_index(c)?;
    }
    Ok(neighbor_inner(&hash.to_ascii_lowercase(), direction))
}

fn neighbor_inner(hash: &str, direction: Direction) -> String {
    let Some(last) = hash.as_bytes().last().copied() else {
        return String::new();
    };
    let parent = &hash[..hash.len() - 1];
    let tables = adjacency(direction);
    let odd = hash.len() % 2 == 1;
    let (neighbor, border) = if odd {
        (tables.neighbor_odd, tables.border_odd)
    } else {
        (tables.neighbor_even, tables.border_even)
    };

    let base = if border.contains(&last) {
        if parent.is_empty() {
            // Pole / antimeridian at the top level: wrap within the cell row.
            String::new()
        } else {
            neighbor_inner(parent, direction)
        }
    } else {
        parent.to_string()
    };

    match neighbor.iter().position(|&c| c == last) {
        Some(index) => {
            let mut out = base;
            out.push(BASE32[index] as char);
            out
        }
        None => String::new(),
    }
}

/// All eight compass neighbors: `[n, ne, e, se, s, sw, w, nw]`.
///
/// Diagonals compose the cardinal walks, so `ne == east(north(c))`.
pub fn get_neighbors(hash: &str) -> Result<[String; 8], GeoError> {
    let n = get_neighbor(hash, Direction::North)?;
    let s = get_neighbor(hash, Direction::South)?;
    let ne = get_neighbor(&n, Direction::East)?;
    let se = get_neighbor(&s, Direction::East)?;
    let sw = get_neighbor(&s, Direction::West)?;
    let nw = get_neighbor(&n, Direction::West)?;
    let e = get_neighbor(hash, Direction::East)?;
    let w = get_neighbor(hash, Direction::West)?;
    Ok([n, ne, e, se, s, sw, w, nw])
}

/// Cell dimensions (degrees of latitude, degrees of longitude) at a
/// given precision.
pub fn cell_dimensions(precision: usize) -> (f64, f64) {
    let total_bits = precision * 5;
    let lng_bits = total_bits.div_ceil(2);
    let lat_bits = total_bits / 2;
    (
        180.0 / (1u64 << lat_bits.min(62)) as f64,
        360.0 / (1u64 << lng_bits.min(62)) as f64,
    )
}

fn base32_index(c: char) -> Result<u8, GeoError> {
    let lower = c.to_ascii_lowercase();
    BASE32
        .iter()
        .position(|&b| b as char == lower)
        .map(|i| i as u8)
        .ok_or(GeoError::InvalidGeohash(c))
}
