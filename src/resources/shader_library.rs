//! Built-in shader source modules, addressed by symbolic tag.
//!
//! # Shader Files
//!
//! The modules are stored as `.wgsl` files in `shaders/`. A module lists the tags it
//! depends on; resolving a program's stage tags concatenates every module the stages
//! need, dependencies first, each exactly once.
//!
//! | Tag | Description |
//! |-----|-------------|
//! | `probe.uniforms` | `ProbeUniforms` block at group 0, binding 0 |
//! | `probe.common` | Cube addressing, panorama mapping, GGX sampling |
//! | `capture.vertex` | Cube capture vertex stage |
//! | `fullscreen.vertex` | Full-screen triangle vertex stage |
//! | `equirect_to_cubemap.fragment` | Panorama lookup per capture direction |
//! | `convolution.environment` | Irradiance and specular integrals over the env cubemap |
//! | `irradiance.fragment` / `irradiance.compute` | Irradiance convolution |
//! | `prefilter.fragment` / `prefilter.compute` | Specular prefilter |
//! | `brdf_lut.fragment` | Split-sum BRDF integration |
//! | `mipmap.fragment` | Downsample of the previous mip |

use std::borrow::Cow;

use super::error::{ResourceError, ResourceResult};

const PROBE_UNIFORMS: &str = include_str!("../../shaders/probe_uniforms.wgsl");
const PROBE_COMMON: &str = include_str!("../../shaders/probe_common.wgsl");
const CAPTURE_VERTEX: &str = include_str!("../../shaders/capture_vertex.wgsl");
const FULLSCREEN_VERTEX: &str = include_str!("../../shaders/fullscreen_vertex.wgsl");
const EQUIRECT_TO_CUBEMAP: &str = include_str!("../../shaders/equirect_to_cubemap.wgsl");
const CONVOLUTION: &str = include_str!("../../shaders/convolution.wgsl");
const IRRADIANCE_FRAGMENT: &str = include_str!("../../shaders/irradiance_fragment.wgsl");
const IRRADIANCE_COMPUTE: &str = include_str!("../../shaders/irradiance_compute.wgsl");
const PREFILTER_FRAGMENT: &str = include_str!("../../shaders/prefilter_fragment.wgsl");
const PREFILTER_COMPUTE: &str = include_str!("../../shaders/prefilter_compute.wgsl");
const BRDF_LUT: &str = include_str!("../../shaders/brdf_lut.wgsl");
const MIPMAP: &str = include_str!("../../shaders/mipmap.wgsl");

struct ShaderModule {
    tag: Cow<'static, str>,
    source: Cow<'static, str>,
    dependencies: Vec<Cow<'static, str>>,
}

/// Collection of shader modules that programs pick stages from.
pub struct ShaderLibrary {
    modules: Vec<ShaderModule>,
}

impl ShaderLibrary {
    /// Every module the probe programs use
    pub fn standard() -> Self {
        Self::empty()
            .with_module("probe.uniforms", PROBE_UNIFORMS, &[])
            .with_module("probe.common", PROBE_COMMON, &[])
            .with_module("capture.vertex", CAPTURE_VERTEX, &["probe.uniforms"])
            .with_module("fullscreen.vertex", FULLSCREEN_VERTEX, &[])
            .with_module(
                "equirect_to_cubemap.fragment",
                EQUIRECT_TO_CUBEMAP,
                &["probe.common", "capture.vertex"],
            )
            .with_module(
                "convolution.environment",
                CONVOLUTION,
                &["probe.uniforms", "probe.common"],
            )
            .with_module(
                "irradiance.fragment",
                IRRADIANCE_FRAGMENT,
                &["capture.vertex", "convolution.environment"],
            )
            .with_module("irradiance.compute", IRRADIANCE_COMPUTE, &["convolution.environment"])
            .with_module(
                "prefilter.fragment",
                PREFILTER_FRAGMENT,
                &["capture.vertex", "convolution.environment"],
            )
            .with_module("prefilter.compute", PREFILTER_COMPUTE, &["convolution.environment"])
            .with_module(
                "brdf_lut.fragment",
                BRDF_LUT,
                &["fullscreen.vertex", "probe.uniforms", "probe.common"],
            )
            .with_module("mipmap.fragment", MIPMAP, &["fullscreen.vertex"])
    }

    pub fn empty() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Register a module. A later module with the same tag replaces the earlier one.
    pub fn with_module(
        mut self,
        tag: impl Into<Cow<'static, str>>,
        source: impl Into<Cow<'static, str>>,
        dependencies: &[&'static str],
    ) -> Self {
        let tag = tag.into();
        self.modules.retain(|m| m.tag != tag);
        self.modules.push(ShaderModule {
            tag,
            source: source.into(),
            dependencies: dependencies.iter().map(|d| Cow::Borrowed(*d)).collect(),
        });
        self
    }

    /// Tags of all registered modules
    pub fn tags(&self) -> impl Iterator<Item = &str> + '_ {
        self.modules.iter().map(|m| m.tag.as_ref())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.module(tag).is_some()
    }

    fn module(&self, tag: &str) -> Option<&ShaderModule> {
        self.modules.iter().find(|m| m.tag == tag)
    }

    /// Module tags needed by `tags`, dependencies first, without duplicates
    pub fn resolve_order(&self, tags: &[&str]) -> ResourceResult<Vec<String>> {
        let mut order = Vec::new();
        let mut visiting = Vec::new();
        for tag in tags {
            self.visit(tag, &mut order, &mut visiting)?;
        }
        Ok(order)
    }

    fn visit(&self, tag: &str, order: &mut Vec<String>, visiting: &mut Vec<String>) -> ResourceResult<()> {
        if order.iter().chain(visiting.iter()).any(|t| t == tag) {
            return Ok(());
        }
        let module = self
            .module(tag)
            .ok_or_else(|| ResourceError::UnknownShaderTag(tag.to_string()))?;
        visiting.push(tag.to_string());
        for dependency in &module.dependencies {
            self.visit(dependency, order, visiting)?;
        }
        visiting.pop();
        order.push(tag.to_string());
        Ok(())
    }

    /// One WGSL source containing every module `tags` need
    pub fn compose(&self, tags: &[&str]) -> ResourceResult<String> {
        let order = self.resolve_order(tags)?;
        let mut source = String::new();
        for tag in &order {
            if let Some(module) = self.module(tag) {
                source.push_str(&format!("// ---- {tag} ----\n"));
                source.push_str(&module.source);
                source.push('\n');
            }
        }
        Ok(source)
    }
}

impl Default for ShaderLibrary {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_library_modules() {
        let library = ShaderLibrary::standard();
        for tag in [
            "probe.uniforms",
            "probe.common",
            "capture.vertex",
            "fullscreen.vertex",
            "equirect_to_cubemap.fragment",
            "convolution.environment",
            "irradiance.fragment",
            "irradiance.compute",
            "prefilter.fragment",
            "prefilter.compute",
            "brdf_lut.fragment",
            "mipmap.fragment",
        ] {
            assert!(library.contains(tag), "missing {tag}");
        }
        assert_eq!(library.tags().count(), 12);
    }

    #[test]
    fn test_dependencies_come_first_once() {
        let library = ShaderLibrary::standard();
        let order = library
            .resolve_order(&["capture.vertex", "irradiance.fragment"])
            .unwrap();
        assert_eq!(
            order,
            vec![
                "probe.uniforms",
                "capture.vertex",
                "probe.common",
                "convolution.environment",
                "irradiance.fragment",
            ]
        );
    }

    #[test]
    fn test_unknown_tag() {
        let library = ShaderLibrary::standard();
        assert!(matches!(
            library.compose(&["irradiance.geometry"]),
            Err(ResourceError::UnknownShaderTag(tag)) if tag == "irradiance.geometry"
        ));
    }

    #[test]
    fn test_custom_module_replaces_and_composes() {
        let library = ShaderLibrary::empty()
            .with_module("a", "fn a() {}", &[])
            .with_module("b", "fn b() { a(); }", &["a"])
            .with_module("a", "fn a() { }", &[]);
        assert_eq!(library.tags().count(), 2);

        let source = library.compose(&["b"]).unwrap();
        let a = source.find("fn a() { }").unwrap();
        let b = source.find("fn b()").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_cycles_terminate() {
        let library = ShaderLibrary::empty()
            .with_module("x", "", &["y"])
            .with_module("y", "", &["x"]);
        assert_eq!(library.resolve_order(&["x"]).unwrap(), vec!["y", "x"]);
    }

    #[test]
    fn test_module_contents() {
        assert!(PROBE_UNIFORMS.contains("struct ProbeUniforms"));
        assert!(PROBE_COMMON.contains("fn cube_direction"));
        assert!(PROBE_COMMON.contains("fn importance_sample_ggx"));
        assert!(CONVOLUTION.contains("fn convolve_irradiance"));
        assert!(CONVOLUTION.contains("fn convolve_specular"));
        assert!(IRRADIANCE_COMPUTE.contains("@workgroup_size(16, 16, 1)"));
        assert!(BRDF_LUT.contains("fn integrate_brdf"));
    }
}
