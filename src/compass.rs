use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

use crate::filters::euler::wrap_angle;

/// Eight-point compass heading of the sensor's forward (+X) axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

const CLOCKWISE: [Direction; 8] = [
    Direction::North,
    Direction::NorthEast,
    Direction::East,
    Direction::SouthEast,
    Direction::South,
    Direction::SouthWest,
    Direction::West,
    Direction::NorthWest,
];

impl Direction {
    /// `yaw` is the fused yaw in radians: 0 faces magnetic north, +π/2 faces east.
    /// Each point owns a 45° sector centered on it.
    pub fn from_heading(yaw: f64) -> Self {
        let sector = (wrap_angle(yaw) + PI / 8.0).rem_euclid(2.0 * PI) / (PI / 4.0);
        CLOCKWISE[(sector as usize) % 8]
    }

    pub fn abbreviation(&self) -> &'static str {
        match self {
            Direction::North => "N",
            Direction::NorthEast => "NE",
            Direction::East => "E",
            Direction::SouthEast => "SE",
            Direction::South => "S",
            Direction::SouthWest => "SW",
            Direction::West => "W",
            Direction::NorthWest => "NW",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbreviation())
    }
}
