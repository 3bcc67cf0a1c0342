//! Draw commands.
//!
//! This module extends [`CommandRecorder`] with non-indexed, indexed and indirect draws.
//! Render pipelines and attachments are outside the scope of this crate; a draw is
//! tracked through the buffers it binds.

use std::ops::Range;

use smallvec::SmallVec;

use crate::{
    buffer::{Buffer, BufferUsages},
    error::{Result, ValidationError},
    utils::check_usage,
};

use super::{Access, BufferBinding, Command, CommandRecorder, compute::validate_indirect};

/// Size of the arguments of a non-indexed indirect draw.
pub const DRAW_INDIRECT_SIZE: u64 = 16;
/// Size of the arguments of an indexed indirect draw.
pub const DRAW_INDEXED_INDIRECT_SIZE: u64 = 20;

#[derive(Clone, Debug)]
pub enum DrawCall {
    Vertices {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    /// Requires an index buffer in the [`RenderBindings`].
    Indexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
    /// Arguments read from `buffer` at `offset` when the draw executes.
    Indirect {
        buffer: Buffer,
        offset: u64,
        indexed: bool,
    },
}

impl DrawCall {
    fn is_indexed(&self) -> bool {
        match self {
            DrawCall::Vertices { .. } => false,
            DrawCall::Indexed { .. } => true,
            DrawCall::Indirect { indexed, .. } => *indexed,
        }
    }
}

/// Buffers bound for a draw.
#[derive(Clone, Debug, Default)]
pub struct RenderBindings {
    pub vertex_buffers: SmallVec<[Buffer; 2]>,
    pub index_buffer: Option<Buffer>,
    pub bindings: SmallVec<[BufferBinding; 4]>,
}

impl RenderBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex_buffer(mut self, buffer: &Buffer) -> Self {
        self.vertex_buffers.push(buffer.clone());
        self
    }

    pub fn index_buffer(mut self, buffer: &Buffer) -> Self {
        self.index_buffer = Some(buffer.clone());
        self
    }

    pub fn binding(mut self, binding: BufferBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub(super) fn push_accesses<'a>(&'a self, accesses: &mut SmallVec<[(&'a Buffer, Access); 4]>) {
        accesses.extend(self.vertex_buffers.iter().map(|b| (b, Access::Read)));
        accesses.extend(self.index_buffer.iter().map(|b| (b, Access::Read)));
        accesses.extend(self.bindings.iter().map(|b| (&b.buffer, b.ty.access())));
    }
}

impl CommandRecorder {
    pub fn draw(
        &mut self,
        vertices: Range<u32>,
        instances: Range<u32>,
        resources: RenderBindings,
    ) -> Result<()> {
        self.record(Command::Draw {
            call: DrawCall::Vertices {
                vertices,
                instances,
            },
            resources,
        })
    }

    /// Draws indexed primitives. `resources` must carry an index buffer.
    pub fn draw_indexed(
        &mut self,
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
        resources: RenderBindings,
    ) -> Result<()> {
        self.record(Command::Draw {
            call: DrawCall::Indexed {
                indices,
                base_vertex,
                instances,
            },
            resources,
        })
    }

    /// Draws with arguments read from `indirect`. The draw is indexed when `resources`
    /// carries an index buffer, and then reads 20 bytes instead of 16.
    pub fn draw_indirect(
        &mut self,
        indirect: &Buffer,
        offset: u64,
        resources: RenderBindings,
    ) -> Result<()> {
        let indexed = resources.index_buffer.is_some();
        self.record(Command::Draw {
            call: DrawCall::Indirect {
                buffer: indirect.clone(),
                offset,
                indexed,
            },
            resources,
        })
    }
}

pub(super) fn validate_draw(call: &DrawCall, resources: &RenderBindings) -> Result<(), ValidationError> {
    if let DrawCall::Indirect {
        buffer,
        offset,
        indexed,
    } = call
    {
        let size = if *indexed {
            DRAW_INDEXED_INDIRECT_SIZE
        } else {
            DRAW_INDIRECT_SIZE
        };
        validate_indirect(buffer, *offset, size)?;
    }
    match (&resources.index_buffer, call.is_indexed()) {
        (Some(index), _) => check_usage(index.id(), index.usage(), BufferUsages::INDEX)?,
        (None, true) => return Err(ValidationError::MissingIndexBuffer),
        (None, false) => {}
    }
    for vertex in &resources.vertex_buffers {
        check_usage(vertex.id(), vertex.usage(), BufferUsages::VERTEX)?;
    }
    resources.bindings.iter().try_for_each(BufferBinding::validate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Device, buffer::BufferDescriptor, engine::SoftwareEngine};

    fn buffer(device: &Device, usage: BufferUsages) -> Buffer {
        device
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 64,
                usage,
                mapped_at_creation: false,
            })
            .unwrap()
    }

    #[test]
    fn test_draw_validation() {
        let device = crate::device::lenient_device(SoftwareEngine::new());
        let vertices = buffer(&device, BufferUsages::VERTEX);
        let indices = buffer(&device, BufferUsages::INDEX);
        let args = buffer(&device, BufferUsages::INDIRECT);
        let uniforms = buffer(&device, BufferUsages::UNIFORM);
        let mut recorder = device.create_command_recorder(None);

        let err = recorder
            .draw(0..3, 0..1, RenderBindings::new().vertex_buffer(&indices))
            .unwrap_err();
        assert!(matches!(
            err.as_validation(),
            Some(ValidationError::MissingUsage {
                required: BufferUsages::VERTEX,
                ..
            })
        ));
        let err = recorder
            .draw_indexed(0..3, 0, 0..1, RenderBindings::new().vertex_buffer(&vertices))
            .unwrap_err();
        assert_eq!(err.as_validation(), Some(&ValidationError::MissingIndexBuffer));
        // Indexed indirect arguments are 20 bytes: 48 + 20 > 64.
        let err = recorder
            .draw_indirect(&args, 48, RenderBindings::new().index_buffer(&indices))
            .unwrap_err();
        assert!(matches!(
            err.as_validation(),
            Some(ValidationError::OutOfBounds { .. })
        ));

        let resources = RenderBindings::new()
            .vertex_buffer(&vertices)
            .binding(BufferBinding::uniform(&uniforms));
        recorder.draw(0..3, 0..1, resources.clone()).unwrap();
        recorder
            .draw_indexed(0..6, 0, 0..2, resources.clone().index_buffer(&indices))
            .unwrap();
        recorder.draw_indirect(&args, 48, resources).unwrap();
        let list = recorder.finish().unwrap();
        assert_eq!(list.len(), 3);
        assert!(list.buffer_accesses().all(|(_, access)| access == Access::Read));
    }
}
