//! Pipeline layouts and pipelines.

use crate::deferred::Object;
use crate::engine::{Core, Engine};
use crate::error::{driver, Result};
use crate::renderer::Tracked;
use crate::uniform::{self, FactoryId, UniformSetFactory};
use ash::vk;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handles of a released pipeline layout.
pub struct PipelineLayoutResources {
    layout: vk::PipelineLayout,
    factories: Vec<FactoryId>,
    pub(crate) ts: u64,
}

impl PipelineLayoutResources {
    /// # Safety
    /// No pending GPU work may use the layout.
    pub(crate) unsafe fn destroy(self, core: &Core) {
        core.device.destroy_pipeline_layout(self.layout);
        for id in self.factories {
            uniform::release_factory(core, id);
        }
    }
}

/// Pipeline layout over the set layouts of one or more factories.
///
/// Holds a reference on every factory until destroyed.
pub struct PipelineLayout {
    engine: Engine,
    layout: vk::PipelineLayout,
    factories: Vec<FactoryId>,
    ts: AtomicU64,
}

impl PipelineLayout {
    /// Create a layout with set `i` taken from `factories[i]`.
    pub fn new(engine: &Engine, factories: &[&UniformSetFactory]) -> Result<Self> {
        Self::with_push_constants(engine, factories, &[])
    }

    pub fn with_push_constants(
        engine: &Engine,
        factories: &[&UniformSetFactory],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        engine.check_live()?;
        let set_layouts: Vec<_> = factories.iter().map(|f| f.layout()).collect();
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(push_constant_ranges);

        // SAFETY: the device is valid.
        let layout = unsafe { engine.device().create_pipeline_layout(&layout_info) }
            .map_err(driver("vkCreatePipelineLayout"))?;

        let mut retained = Vec::with_capacity(factories.len());
        {
            let mut usf = engine.usf_lock();
            for factory in factories {
                if let Err(e) = factory.retain(&mut usf) {
                    drop(usf);
                    let resources = PipelineLayoutResources {
                        layout,
                        factories: retained,
                        ts: 0,
                    };
                    // SAFETY: never used.
                    unsafe { resources.destroy(engine.core()) };
                    return Err(e);
                }
                retained.push(factory.id());
            }
        }

        Ok(Self {
            engine: engine.clone(),
            layout,
            factories: retained,
            ts: AtomicU64::new(0),
        })
    }

    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Tracked for PipelineLayout {
    fn mark_used(&self, ts: u64) {
        self.ts.fetch_max(ts, Ordering::AcqRel);
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        let resources = PipelineLayoutResources {
            layout: self.layout,
            factories: std::mem::take(&mut self.factories),
            ts: self.ts.load(Ordering::Acquire),
        };
        self.engine.delete_object(Object::PipelineLayout(resources));
    }
}

/// Handle of a released pipeline.
pub struct PipelineResources {
    pipeline: vk::Pipeline,
    pub(crate) ts: u64,
}

impl PipelineResources {
    /// # Safety
    /// No pending GPU work may use the pipeline.
    pub(crate) unsafe fn destroy(self, core: &Core) {
        core.device.destroy_pipeline(self.pipeline);
    }
}

/// Compute pipeline.
///
/// The [`PipelineLayout`] it was built with must outlive it.
pub struct ComputePipeline {
    engine: Engine,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    ts: AtomicU64,
}

impl ComputePipeline {
    /// Create a compute pipeline from the cached shader module `shader`,
    /// loading its SPIR-V with `load` on first use.
    pub fn new(
        engine: &Engine,
        layout: &PipelineLayout,
        shader: &str,
        load: impl FnOnce() -> Result<Vec<u32>>,
    ) -> Result<Self> {
        engine.check_live()?;
        let module = engine.shader_module(shader, load)?;

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout.handle());

        // SAFETY: the module and layout are live.
        let pipeline = unsafe { engine.device().create_compute_pipeline(&pipeline_info) }
            .map_err(driver("vkCreateComputePipelines"))?;

        Ok(Self {
            engine: engine.clone(),
            pipeline,
            layout: layout.handle(),
            ts: AtomicU64::new(0),
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Tracked for ComputePipeline {
    fn mark_used(&self, ts: u64) {
        self.ts.fetch_max(ts, Ordering::AcqRel);
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        self.engine
            .delete_object(Object::ComputePipeline(PipelineResources {
                pipeline: self.pipeline,
                ts: self.ts.load(Ordering::Acquire),
            }));
    }
}

/// Graphics pipeline configuration.
#[derive(Clone)]
pub struct GraphicsPipelineConfig {
    /// Shader cache names.
    pub vertex_shader: String,
    pub fragment_shader: String,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub blend: bool,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_shader: String::new(),
            fragment_shader: String::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            blend: false,
            color_formats: vec![vk::Format::R8G8B8A8_UNORM],
            depth_format: Some(vk::Format::D32_SFLOAT),
        }
    }
}

/// Graphics pipeline using dynamic rendering.
///
/// The [`PipelineLayout`] it was built with must outlive it.
pub struct GraphicsPipeline {
    engine: Engine,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    ts: AtomicU64,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline. Shader modules come from the engine's
    /// cache; `load` is called with a shader name on a cache miss.
    pub fn new(
        engine: &Engine,
        layout: &PipelineLayout,
        config: &GraphicsPipelineConfig,
        mut load: impl FnMut(&str) -> Result<Vec<u32>>,
    ) -> Result<Self> {
        engine.check_live()?;
        let vert_module =
            engine.shader_module(&config.vertex_shader, || load(&config.vertex_shader))?;
        let frag_module =
            engine.shader_module(&config.fragment_shader, || load(&config.fragment_shader))?;

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(c"main"),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(config.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments: Vec<_> = config
            .color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(config.blend)
                    .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                    .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                    .color_blend_op(vk::BlendOp::ADD)
                    .src_alpha_blend_factor(vk::BlendFactor::ONE)
                    .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                    .alpha_blend_op(vk::BlendOp::ADD)
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&config.color_formats);
        if let Some(depth_format) = config.depth_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
        }

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout.handle())
            .push_next(&mut rendering_info);

        // SAFETY: modules and layout are live.
        let pipeline = unsafe { engine.device().create_graphics_pipeline(&pipeline_info) }
            .map_err(driver("vkCreateGraphicsPipelines"))?;

        Ok(Self {
            engine: engine.clone(),
            pipeline,
            layout: layout.handle(),
            ts: AtomicU64::new(0),
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Tracked for GraphicsPipeline {
    fn mark_used(&self, ts: u64) {
        self.ts.fetch_max(ts, Ordering::AcqRel);
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        self.engine
            .delete_object(Object::GraphicsPipeline(PipelineResources {
                pipeline: self.pipeline,
                ts: self.ts.load(Ordering::Acquire),
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::UpdateMode;
    use crate::config::EngineConfig;
    use crate::error::EngineError;
    use crate::mock::{init_tracing, HandleKind, MockDevice, MockOp};
    use crate::uniform::{UniformBinding, UniformType};
    use std::sync::Arc;

    fn setup() -> (Arc<MockDevice>, Engine, UniformSetFactory) {
        init_tracing();
        let device = MockDevice::discrete();
        let engine = Engine::new(device.clone(), EngineConfig::new("pipeline-test")).unwrap();
        let factory = UniformSetFactory::new(
            &engine,
            UpdateMode::Synchronous,
            &[UniformBinding::new(
                0,
                UniformType::StorageBuffer,
                vk::ShaderStageFlags::COMPUTE,
            )],
        )
        .unwrap();
        (device, engine, factory)
    }

    fn spirv() -> Result<Vec<u32>> {
        Ok(vec![0x0723_0203, 0x0001_0300])
    }

    #[test]
    fn compute_pipelines_share_cached_shader_modules() {
        let (device, engine, factory) = setup();
        let layout = PipelineLayout::new(&engine, &[&factory]).unwrap();

        let a = ComputePipeline::new(&engine, &layout, "blur.comp", spirv).unwrap();
        let b = ComputePipeline::new(&engine, &layout, "blur.comp", || {
            panic!("cached module must not reload")
        })
        .unwrap();
        assert_ne!(a.handle(), b.handle());
        assert_eq!(a.layout(), layout.handle());
        assert_eq!(device.calls(MockOp::CreateShaderModule), 1);

        drop((a, b));
        engine.wait_deletions();
        assert_eq!(device.live(HandleKind::Pipeline), 0);
        // Cached modules live until the engine goes away.
        assert_eq!(device.live(HandleKind::ShaderModule), 1);
    }

    #[test]
    fn graphics_pipeline_loads_both_stages() {
        let (device, engine, factory) = setup();
        let layout = PipelineLayout::new(&engine, &[&factory]).unwrap();
        let config = GraphicsPipelineConfig {
            vertex_shader: "quad.vert".into(),
            fragment_shader: "quad.frag".into(),
            ..Default::default()
        };

        let mut loaded = Vec::new();
        let pipeline = GraphicsPipeline::new(&engine, &layout, &config, |name| {
            loaded.push(name.to_string());
            spirv()
        })
        .unwrap();
        assert_eq!(loaded, ["quad.vert", "quad.frag"]);
        assert_eq!(device.live(HandleKind::Pipeline), 1);
        drop(pipeline);
    }

    #[test]
    fn shader_load_failure_creates_nothing() {
        let (device, engine, factory) = setup();
        let layout = PipelineLayout::new(&engine, &[&factory]).unwrap();

        let result = ComputePipeline::new(&engine, &layout, "missing.comp", || {
            Err(EngineError::Other("not found".into()))
        });
        assert!(result.is_err());
        assert_eq!(device.calls(MockOp::CreatePipeline), 0);
    }

    #[test]
    fn layout_creation_failure_keeps_refcount() {
        let (device, engine, factory) = setup();

        device.fail_next(MockOp::CreatePipelineLayout);
        assert!(PipelineLayout::new(&engine, &[&factory]).is_err());
        assert_eq!(engine.usf_lock().refs(factory.id()), Some(1));

        let layout = PipelineLayout::new(&engine, &[&factory, &factory]).unwrap();
        assert_eq!(engine.usf_lock().refs(factory.id()), Some(3));
        drop(layout);
        engine.wait_deletions();
        assert_eq!(engine.usf_lock().refs(factory.id()), Some(1));
    }
}
