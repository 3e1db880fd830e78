// SPDX-License-Identifier: AGPL-3.0-or-later
//! GPU f64 engine over wgpu.
//!
//! Requests `SHADER_F64`, compiles all pipelines once at construction, and
//! keeps every instance buffer resident in device storage. Kernels enqueue
//! onto the device queue and return without waiting — the asynchronous
//! contract — while reads (`get_partials`, the integration kernels) copy
//! through a staging buffer with `map_async` + `poll(Wait)` and so act as
//! barriers. [`Backend::wait_for_partials`] drains the queue explicitly.
//!
//! Each instance requests its own device, so no streams, buffers, or
//! contexts are shared across instances even on the same adapter.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use super::{shaders, Backend, EdgeArgs};
use crate::buffers::EigenDecomposition;
use crate::error::{Error, Result};
use crate::ops::Operation;
use crate::sizing::InstanceSizing;

const WORKGROUP: u32 = 64;

/// Exponent saturation bound, matching the CPU engines.
const MAX_EXP_ARG: f64 = 709.0;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct AssembleParams {
    state_count: u32,
    category_count: u32,
    pad0: u32,
    pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct PeelParams {
    state_count: u32,
    pattern_count: u32,
    category_count: u32,
    rescale: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct RootParams {
    state_count: u32,
    pattern_count: u32,
    category_count: u32,
    pad0: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct EdgeParams {
    state_count: u32,
    pattern_count: u32,
    category_count: u32,
    has_first: u32,
    has_second: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

struct Pipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

/// The wgpu f64 backend.
pub(crate) struct GpuBackend {
    sizing: InstanceSizing,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,

    assemble: Pipeline,
    peel_pp: Pipeline,
    peel_sp: Pipeline,
    peel_ss: Pipeline,
    root: Pipeline,
    edge_p: Pipeline,
    edge_s: Pipeline,

    partials: Vec<wgpu::Buffer>,
    matrices: Vec<wgpu::Buffer>,
    /// Raw (not log) per-pattern scalers; host takes logs at readback.
    scalers: Vec<wgpu::Buffer>,
    tip_states: Vec<Option<wgpu::Buffer>>,
    scratch: wgpu::Buffer,

    /// Eigen triples stay host-side for the exponential evaluation; the
    /// `U`/`U⁻¹` matrices are mirrored on device for assembly.
    eigens: Vec<EigenDecomposition>,
    eigen_vectors: Vec<wgpu::Buffer>,
    eigen_inverse: Vec<wgpu::Buffer>,
    rates: Vec<f64>,
}

impl GpuBackend {
    /// Request the adapter, create the device, compile every pipeline, and
    /// allocate the instance's device buffers.
    pub(crate) fn create(sizing: InstanceSizing, adapter_index: usize) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .nth(adapter_index)
            .ok_or_else(|| {
                Error::UnidentifiedException(format!("GPU adapter {adapter_index} disappeared"))
            })?;
        if !adapter.features().contains(wgpu::Features::SHADER_F64) {
            return Err(Error::UnidentifiedException(
                "adapter lost SHADER_F64 support".into(),
            ));
        }
        let limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("canopy f64 likelihood device"),
                required_features: wgpu::Features::SHADER_F64,
                required_limits: wgpu::Limits {
                    max_storage_buffer_binding_size: limits
                        .max_storage_buffer_binding_size
                        .min(512 * 1024 * 1024),
                    max_buffer_size: limits.max_buffer_size.min(1024 * 1024 * 1024),
                    max_storage_buffers_per_shader_stage: limits
                        .max_storage_buffers_per_shader_stage
                        .min(16),
                    ..wgpu::Limits::default()
                },
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        ))
        .map_err(|e| Error::UnidentifiedException(format!("device creation: {e}")))?;
        let device = Arc::new(device);
        let queue = Arc::new(queue);

        let assemble = build_pipeline(&device, shaders::ASSEMBLE_MATRIX, "assemble", &[
            Binding::Uniform,
            Binding::ReadOnly,
            Binding::ReadOnly,
            Binding::ReadOnly,
            Binding::ReadWrite,
        ]);
        let peel_layout = [
            Binding::Uniform,
            Binding::ReadOnly,
            Binding::ReadOnly,
            Binding::ReadOnly,
            Binding::ReadOnly,
            Binding::ReadWrite,
            Binding::ReadWrite,
        ];
        let peel_pp = build_pipeline(
            &device,
            &shaders::peel_partials_partials(),
            "peel pp",
            &peel_layout,
        );
        let peel_sp = build_pipeline(
            &device,
            &shaders::peel_states_partials(),
            "peel sp",
            &peel_layout,
        );
        let peel_ss = build_pipeline(
            &device,
            &shaders::peel_states_states(),
            "peel ss",
            &peel_layout,
        );
        let root = build_pipeline(&device, shaders::ROOT_INTEGRATE, "root", &[
            Binding::Uniform,
            Binding::ReadOnly,
            Binding::ReadOnly,
            Binding::ReadOnly,
            Binding::ReadWrite,
        ]);
        let edge_layout = [
            Binding::Uniform,
            Binding::ReadOnly,
            Binding::ReadOnly,
            Binding::ReadOnly,
            Binding::ReadOnly,
            Binding::ReadOnly,
            Binding::ReadOnly,
            Binding::ReadOnly,
            Binding::ReadWrite,
            Binding::ReadWrite,
            Binding::ReadWrite,
        ];
        let edge_p = build_pipeline(&device, &shaders::edge_partials(), "edge p", &edge_layout);
        let edge_s = build_pipeline(&device, &shaders::edge_states(), "edge s", &edge_layout);

        let partials_bytes = (sizing.partials_len() * 8) as u64;
        let matrix_bytes = (sizing.matrix_len() * 8) as u64;
        let partials = (0..sizing.partials_buffer_count)
            .map(|i| storage_buffer(&device, partials_bytes, &format!("partials {i}")))
            .collect();
        let matrices = (0..sizing.matrix_buffer_count)
            .map(|i| storage_buffer(&device, matrix_bytes, &format!("matrix {i}")))
            .collect();
        let ones = vec![1.0_f64; sizing.pattern_count];
        let scalers = (0..sizing.partials_buffer_count)
            .map(|i| init_buffer(&device, &ones, &format!("scalers {i}")))
            .collect();
        let scratch = storage_buffer(&device, partials_bytes, "peel scratch");

        let eigen_len = sizing.eigen_matrix_len();
        let eigens = (0..sizing.eigen_buffer_count)
            .map(|_| EigenDecomposition {
                vectors: vec![0.0; eigen_len],
                inverse: vec![0.0; eigen_len],
                values: vec![0.0; sizing.state_count],
            })
            .collect();
        let eigen_vectors = (0..sizing.eigen_buffer_count)
            .map(|i| storage_buffer(&device, (eigen_len * 8) as u64, &format!("eigen U {i}")))
            .collect();
        let eigen_inverse = (0..sizing.eigen_buffer_count)
            .map(|i| storage_buffer(&device, (eigen_len * 8) as u64, &format!("eigen U-1 {i}")))
            .collect();

        Ok(Self {
            sizing,
            device,
            queue,
            assemble,
            peel_pp,
            peel_sp,
            peel_ss,
            root,
            edge_p,
            edge_s,
            partials,
            matrices,
            scalers,
            tip_states: (0..sizing.compact_buffer_count).map(|_| None).collect(),
            scratch,
            eigens,
            eigen_vectors,
            eigen_inverse,
            rates: vec![1.0; sizing.category_count],
        })
    }

    fn read_f64(&self, buffer: &wgpu::Buffer, count: usize) -> Result<Vec<f64>> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: (count * 8) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, (count * 8) as u64);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|e| Error::UnidentifiedException(format!("map callback channel: {e}")))?
            .map_err(|e| Error::UnidentifiedException(format!("buffer mapping: {e}")))?;

        let data = slice.get_mapped_range();
        let values: Vec<f64> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(values)
    }

    /// Read one scaling buffer and convert the raw scalers to logs.
    fn read_log_scalers(&self, index: usize) -> Result<Vec<f64>> {
        let raw = self.read_f64(&self.scalers[index], self.sizing.pattern_count)?;
        Ok(raw.iter().map(|&v| v.ln()).collect())
    }

    fn tip_buffer(&self, index: usize) -> Option<&wgpu::Buffer> {
        if index < self.sizing.tip_count {
            self.tip_states.get(index).and_then(Option::as_ref)
        } else {
            None
        }
    }

    fn uniform<T: Pod>(&self, value: &T, label: &str) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::bytes_of(value),
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    fn storage_init(&self, data: &[f64], label: &str) -> wgpu::Buffer {
        init_buffer(&self.device, data, label)
    }

    fn bind(
        &self,
        pipeline: &Pipeline,
        buffers: &[&wgpu::Buffer],
        label: &str,
    ) -> wgpu::BindGroup {
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, buffer)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &pipeline.layout,
            entries: &entries,
        })
    }

    fn dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pipeline: &Pipeline,
        bind_group: &wgpu::BindGroup,
        items: u32,
    ) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("canopy kernel"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(items.div_ceil(WORKGROUP), 1, 1);
    }
}

impl Backend for GpuBackend {
    fn set_partials(&mut self, index: usize, values: &[f64]) -> Result<()> {
        self.queue
            .write_buffer(&self.partials[index], 0, bytemuck::cast_slice(values));
        Ok(())
    }

    fn get_partials(&mut self, index: usize, out: &mut [f64]) -> Result<()> {
        let values = self.read_f64(&self.partials[index], self.sizing.partials_len())?;
        out.copy_from_slice(&values);
        Ok(())
    }

    fn set_tip_states(&mut self, tip_index: usize, states: &[u32]) -> Result<()> {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("tip states"),
                contents: bytemuck::cast_slice(states),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            });
        self.tip_states[tip_index] = Some(buffer);
        Ok(())
    }

    fn set_eigen_decomposition(
        &mut self,
        index: usize,
        vectors: &[f64],
        inverse: &[f64],
        values: &[f64],
    ) -> Result<()> {
        let eigen = &mut self.eigens[index];
        eigen.vectors.copy_from_slice(vectors);
        eigen.inverse.copy_from_slice(inverse);
        eigen.values.copy_from_slice(values);
        self.queue
            .write_buffer(&self.eigen_vectors[index], 0, bytemuck::cast_slice(vectors));
        self.queue
            .write_buffer(&self.eigen_inverse[index], 0, bytemuck::cast_slice(inverse));
        Ok(())
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        self.rates.copy_from_slice(rates);
        Ok(())
    }

    fn set_transition_matrix(&mut self, index: usize, matrix: &[f64]) -> Result<()> {
        self.queue
            .write_buffer(&self.matrices[index], 0, bytemuck::cast_slice(matrix));
        Ok(())
    }

    fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        prob_indices: &[usize],
        d1_indices: Option<&[usize]>,
        d2_indices: Option<&[usize]>,
        edge_lengths: &[f64],
    ) -> Result<()> {
        let s = self.sizing.state_count;
        let cc = self.sizing.category_count;
        let params = self.uniform(
            &AssembleParams {
                state_count: s as u32,
                category_count: cc as u32,
                pad0: 0,
                pad1: 0,
            },
            "assemble params",
        );
        let total = (cc * s * s) as u32;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("update matrices"),
            });
        let mut diag_p = vec![0.0_f64; cc * s];
        let mut diag_d1 = vec![0.0_f64; cc * s];
        let mut diag_d2 = vec![0.0_f64; cc * s];
        for (i, &t) in edge_lengths.iter().enumerate() {
            for c in 0..cc {
                let rate = self.rates[c];
                for k in 0..s {
                    let lambda = self.eigens[eigen_index].values[k];
                    let e = (lambda * t * rate).min(MAX_EXP_ARG).exp();
                    diag_p[c * s + k] = e;
                    diag_d1[c * s + k] = lambda * rate * e;
                    diag_d2[c * s + k] = lambda * rate * lambda * rate * e;
                }
            }
            let mut jobs: Vec<(&[f64], usize)> = vec![(&diag_p, prob_indices[i])];
            if let Some(d1) = d1_indices {
                jobs.push((&diag_d1, d1[i]));
            }
            if let Some(d2) = d2_indices {
                jobs.push((&diag_d2, d2[i]));
            }
            for (diag, matrix_index) in jobs {
                let diag_buf = self.storage_init(diag, "assemble diag");
                let bind = self.bind(
                    &self.assemble,
                    &[
                        &params,
                        &self.eigen_vectors[eigen_index],
                        &self.eigen_inverse[eigen_index],
                        &diag_buf,
                        &self.matrices[matrix_index],
                    ],
                    "assemble bind",
                );
                self.dispatch(&mut encoder, &self.assemble, &bind, total);
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn update_partials(&mut self, operations: &[Operation], rescale: bool) -> Result<()> {
        let params = self.uniform(
            &PeelParams {
                state_count: self.sizing.state_count as u32,
                pattern_count: self.sizing.pattern_count as u32,
                category_count: self.sizing.category_count as u32,
                rescale: u32::from(rescale),
            },
            "peel params",
        );
        let patterns = self.sizing.pattern_count as u32;
        let partials_bytes = (self.sizing.partials_len() * 8) as u64;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("update partials"),
            });
        for op in operations {
            let tips1 = self.tip_buffer(op.child1);
            let tips2 = self.tip_buffer(op.child2);
            // The two child terms multiply, so partials/states swaps into
            // states/partials.
            let (pipeline, child1, m1, child2, m2) = match (tips1, tips2) {
                (Some(x1), Some(x2)) => (&self.peel_ss, x1, op.child1_matrix, x2, op.child2_matrix),
                (Some(x1), None) => (
                    &self.peel_sp,
                    x1,
                    op.child1_matrix,
                    &self.partials[op.child2],
                    op.child2_matrix,
                ),
                (None, Some(x2)) => (
                    &self.peel_sp,
                    x2,
                    op.child2_matrix,
                    &self.partials[op.child1],
                    op.child1_matrix,
                ),
                (None, None) => (
                    &self.peel_pp,
                    &self.partials[op.child1],
                    op.child1_matrix,
                    &self.partials[op.child2],
                    op.child2_matrix,
                ),
            };
            let bind = self.bind(
                pipeline,
                &[
                    &params,
                    &self.matrices[m1],
                    &self.matrices[m2],
                    child1,
                    child2,
                    &self.scratch,
                    &self.scalers[op.dest_scaling],
                ],
                "peel bind",
            );
            self.dispatch(&mut encoder, pipeline, &bind, patterns);
            encoder.copy_buffer_to_buffer(
                &self.scratch,
                0,
                &self.partials[op.destination],
                0,
                partials_bytes,
            );
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn wait_for_partials(&mut self, _destinations: &[usize]) -> Result<()> {
        let _ = self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn root_log_likelihoods(
        &mut self,
        root_indices: &[usize],
        weights: &[f64],
        frequencies: &[f64],
        scaling_indices: &[usize],
        scaling_counts: &[usize],
        out: &mut [f64],
    ) -> Result<()> {
        let s = self.sizing.state_count;
        let cc = self.sizing.category_count;
        let pc = self.sizing.pattern_count;
        let params = self.uniform(
            &RootParams {
                state_count: s as u32,
                pattern_count: pc as u32,
                category_count: cc as u32,
                pad0: 0,
            },
            "root params",
        );

        out.fill(0.0);
        let mut scaling_offset = 0;
        for (i, &root) in root_indices.iter().enumerate() {
            let weights_buf = self.storage_init(&weights[i * cc..(i + 1) * cc], "root weights");
            let freqs_buf = self.storage_init(&frequencies[i * s..(i + 1) * s], "root freqs");
            let out_buf = storage_buffer(&self.device, (pc * 8) as u64, "root out");
            let bind = self.bind(
                &self.root,
                &[
                    &params,
                    &self.partials[root],
                    &weights_buf,
                    &freqs_buf,
                    &out_buf,
                ],
                "root bind",
            );
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("root integrate"),
                });
            self.dispatch(&mut encoder, &self.root, &bind, pc as u32);
            self.queue.submit(std::iter::once(encoder.finish()));

            let lik = self.read_f64(&out_buf, pc)?;
            for (p, site) in out.iter_mut().enumerate() {
                *site += lik[p].ln();
            }
            let scaling = &scaling_indices[scaling_offset..scaling_offset + scaling_counts[i]];
            scaling_offset += scaling_counts[i];
            for &idx in scaling {
                let logs = self.read_log_scalers(idx)?;
                for (p, site) in out.iter_mut().enumerate() {
                    *site += logs[p];
                }
            }
        }
        Ok(())
    }

    fn edge_log_likelihoods(
        &mut self,
        args: &EdgeArgs<'_>,
        out_log_likelihoods: &mut [f64],
        mut out_first_derivatives: Option<&mut [f64]>,
        mut out_second_derivatives: Option<&mut [f64]>,
    ) -> Result<()> {
        let s = self.sizing.state_count;
        let cc = self.sizing.category_count;
        let pc = self.sizing.pattern_count;
        let params = self.uniform(
            &EdgeParams {
                state_count: s as u32,
                pattern_count: pc as u32,
                category_count: cc as u32,
                has_first: u32::from(args.d1_indices.is_some()),
                has_second: u32::from(args.d2_indices.is_some()),
                pad0: 0,
                pad1: 0,
                pad2: 0,
            },
            "edge params",
        );

        out_log_likelihoods.fill(0.0);
        if let Some(d) = out_first_derivatives.as_deref_mut() {
            d.fill(0.0);
        }
        if let Some(d) = out_second_derivatives.as_deref_mut() {
            d.fill(0.0);
        }

        let mut scaling_offset = 0;
        for i in 0..args.parents.len() {
            let prob = args.prob_indices[i];
            let m_d1 = args.d1_indices.map_or(prob, |ix| ix[i]);
            let m_d2 = args.d2_indices.map_or(prob, |ix| ix[i]);
            let (pipeline, child): (&Pipeline, &wgpu::Buffer) =
                match self.tip_buffer(args.children[i]) {
                    Some(states) => (&self.edge_s, states),
                    None => (&self.edge_p, &self.partials[args.children[i]]),
                };
            let weights_buf =
                self.storage_init(&args.weights[i * cc..(i + 1) * cc], "edge weights");
            let freqs_buf =
                self.storage_init(&args.frequencies[i * s..(i + 1) * s], "edge freqs");
            let lik_buf = storage_buffer(&self.device, (pc * 8) as u64, "edge lik");
            let d1_buf = storage_buffer(&self.device, (pc * 8) as u64, "edge d1");
            let d2_buf = storage_buffer(&self.device, (pc * 8) as u64, "edge d2");
            let bind = self.bind(
                pipeline,
                &[
                    &params,
                    &self.partials[args.parents[i]],
                    child,
                    &self.matrices[prob],
                    &self.matrices[m_d1],
                    &self.matrices[m_d2],
                    &weights_buf,
                    &freqs_buf,
                    &lik_buf,
                    &d1_buf,
                    &d2_buf,
                ],
                "edge bind",
            );
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("edge integrate"),
                });
            self.dispatch(&mut encoder, pipeline, &bind, pc as u32);
            self.queue.submit(std::iter::once(encoder.finish()));

            let lik = self.read_f64(&lik_buf, pc)?;
            for (p, site) in out_log_likelihoods.iter_mut().enumerate() {
                *site += lik[p].ln();
            }
            let scaling =
                &args.scaling_indices[scaling_offset..scaling_offset + args.scaling_counts[i]];
            scaling_offset += args.scaling_counts[i];
            for &idx in scaling {
                let logs = self.read_log_scalers(idx)?;
                for (p, site) in out_log_likelihoods.iter_mut().enumerate() {
                    *site += logs[p];
                }
            }
            if let Some(d) = out_first_derivatives.as_deref_mut() {
                let d1 = self.read_f64(&d1_buf, pc)?;
                if let Some(d2_out) = out_second_derivatives.as_deref_mut() {
                    let d2 = self.read_f64(&d2_buf, pc)?;
                    for p in 0..pc {
                        let ratio = d1[p] / lik[p];
                        d[p] += ratio;
                        d2_out[p] += d2[p] / lik[p] - ratio * ratio;
                    }
                } else {
                    for p in 0..pc {
                        d[p] += d1[p] / lik[p];
                    }
                }
            }
        }
        Ok(())
    }
}

enum Binding {
    Uniform,
    ReadOnly,
    ReadWrite,
}

fn build_pipeline(
    device: &wgpu::Device,
    source: &str,
    label: &str,
    bindings: &[Binding],
) -> Pipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
        .iter()
        .enumerate()
        .map(|(i, binding)| wgpu::BindGroupLayoutEntry {
            binding: i as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: match binding {
                    Binding::Uniform => wgpu::BufferBindingType::Uniform,
                    Binding::ReadOnly => wgpu::BufferBindingType::Storage { read_only: true },
                    Binding::ReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
                },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect();
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: "main",
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    });
    Pipeline { pipeline, layout }
}

fn storage_buffer(device: &wgpu::Device, size: u64, label: &str) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn init_buffer(device: &wgpu::Device, data: &[f64], label: &str) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::cast_slice(data),
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST,
    })
}
