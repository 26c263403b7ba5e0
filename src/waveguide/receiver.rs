//! Directional receiver: accumulates pressure and intensity at one node.

use crate::error::{EngineError, Result};
use crate::geom::Vec3;
use crate::waveguide::mesh::{MeshDescriptor, NO_NEIGHBOR, PORTS};

/// One step of receiver output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceiverOutput {
    /// Instantaneous intensity `v * p`.
    pub intensity: [f64; 3],
    /// Pressure at the output node.
    pub pressure: f32,
}

/// Anything that consumes the pressure buffer once per step.
pub trait PressureReceiver {
    fn consume(&mut self, current: &[f32], step: usize);
}

/// Reads the output node and its six axial neighbours each step and
/// integrates the velocity `v -= grad(p) / (rho * fs)`.
#[derive(Debug)]
pub struct DirectionalReceiver {
    spacing: f64,
    sample_rate: f64,
    ambient_density: f64,
    output_node: usize,
    surrounding: [u32; PORTS],
    velocity: [f64; 3],
    outputs: Vec<ReceiverOutput>,
}

impl DirectionalReceiver {
    /// Fails when the node sits at the mesh edge: the gradient stencil
    /// needs all six neighbours.
    pub fn new(
        descriptor: &MeshDescriptor,
        sample_rate: f64,
        ambient_density: f64,
        output_node: u32,
        position: Vec3,
    ) -> Result<Self> {
        let surrounding = descriptor.neighbors(output_node);
        if surrounding.contains(&NO_NEIGHBOR) {
            return Err(EngineError::ReceiverOutside { position });
        }
        Ok(Self {
            spacing: descriptor.spacing as f64,
            sample_rate,
            ambient_density,
            output_node: output_node as usize,
            surrounding,
            velocity: [0.0; 3],
            outputs: Vec::new(),
        })
    }

    /// Everything recorded so far.
    pub fn outputs(&self) -> &[ReceiverOutput] {
        &self.outputs
    }

    pub fn into_outputs(self) -> Vec<ReceiverOutput> {
        self.outputs
    }

    /// Reads the buffer for one step and returns that step's output.
    pub fn process(&mut self, buffer: &[f32]) -> ReceiverOutput {
        let pressure = buffer[self.output_node];
        let mut differences = [0.0f64; PORTS];
        for (slot, &index) in self.surrounding.iter().enumerate() {
            differences[slot] = (buffer[index as usize] - pressure) as f64 / self.spacing;
        }

        let gradient = [
            (differences[1] - differences[0]) * 0.5,
            (differences[3] - differences[2]) * 0.5,
            (differences[5] - differences[4]) * 0.5,
        ];

        let scale = 1.0 / (self.ambient_density * self.sample_rate);
        for (v, g) in self.velocity.iter_mut().zip(gradient.iter()) {
            *v -= g * scale;
        }

        let output = ReceiverOutput {
            intensity: [
                self.velocity[0] * pressure as f64,
                self.velocity[1] * pressure as f64,
                self.velocity[2] * pressure as f64,
            ],
            pressure,
        };
        self.outputs.push(output);
        output
    }
}

impl PressureReceiver for DirectionalReceiver {
    fn consume(&mut self, current: &[f32], _step: usize) {
        self.process(current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> MeshDescriptor {
        MeshDescriptor {
            min_corner: Vec3::ZERO,
            dimensions: [5, 5, 5],
            spacing: 0.1,
        }
    }

    #[test]
    fn test_edge_node_is_rejected() {
        let desc = descriptor();
        let edge = desc.index([0, 2, 2]);
        let err =
            DirectionalReceiver::new(&desc, 4000.0, 1.2, edge, Vec3::ZERO).unwrap_err();
        assert_eq!(err.kind(), "mesh/receiver_outside");
    }

    #[test]
    fn test_uniform_field_has_zero_intensity() {
        let desc = descriptor();
        let centre = desc.index([2, 2, 2]);
        let mut receiver =
            DirectionalReceiver::new(&desc, 4000.0, 1.2, centre, Vec3::ZERO).unwrap();
        let buffer = vec![0.5f32; desc.num_nodes()];
        let out = receiver.process(&buffer);
        assert_eq!(out.pressure, 0.5);
        assert!(out.intensity.iter().all(|&i| i.abs() < 1e-12));
    }

    #[test]
    fn test_gradient_drives_velocity() {
        let desc = descriptor();
        let centre = desc.index([2, 2, 2]);
        let mut receiver =
            DirectionalReceiver::new(&desc, 4000.0, 1.2, centre, Vec3::ZERO).unwrap();
        // Pressure increasing along +x produces a negative x velocity.
        let mut buffer = vec![0.0f32; desc.num_nodes()];
        for index in 0..desc.num_nodes() as u32 {
            buffer[index as usize] = desc.locator(index)[0] as f32;
        }
        let first = receiver.process(&buffer);
        assert!(first.intensity[0] < 0.0, "intensity should point down-gradient");
        // Velocity integrates over steps.
        let second = receiver.process(&buffer);
        assert!(second.intensity[0] < first.intensity[0]);
    }
}
