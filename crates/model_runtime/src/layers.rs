//! Слои Sequential-модели: разбор конфигурации, вывод форм, прямой проход (channels_last).

use std::collections::HashMap;

use ndarray::{Array2, Array4, ArrayD, Axis, Ix1, Ix2, Ix4, IxDyn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::tensor::{element_count, OwnedTensor};

fn exec(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Execution(e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Linear,
    Relu,
    Relu6,
    Sigmoid,
    Tanh,
    Softmax,
    Elu,
    Softplus,
}

impl Activation {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "" | "linear" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "relu6" => Ok(Activation::Relu6),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "softmax" => Ok(Activation::Softmax),
            "elu" => Ok(Activation::Elu),
            "softplus" => Ok(Activation::Softplus),
            other => Err(RuntimeError::UnsupportedActivation(other.to_string())),
        }
    }

    pub(crate) fn apply(self, x: &mut ArrayD<f32>) {
        match self {
            Activation::Linear => {}
            Activation::Relu => x.mapv_inplace(|v| v.max(0.0)),
            Activation::Relu6 => x.mapv_inplace(|v| v.clamp(0.0, 6.0)),
            Activation::Sigmoid => x.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp())),
            Activation::Tanh => x.mapv_inplace(f32::tanh),
            Activation::Elu => x.mapv_inplace(|v| if v > 0.0 { v } else { v.exp() - 1.0 }),
            Activation::Softplus => x.mapv_inplace(|v| v.exp().ln_1p()),
            Activation::Softmax => softmax_last_axis(x),
        }
    }
}

fn softmax_last_axis(x: &mut ArrayD<f32>) {
    if x.ndim() == 0 {
        x.fill(1.0);
        return;
    }
    let axis = Axis(x.ndim() - 1);
    for mut lane in x.lanes_mut(axis) {
        let max = lane.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        if sum > 0.0 {
            lane.mapv_inplace(|v| v / sum);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

impl Padding {
    fn output_len(self, input: usize, window: usize, stride: usize) -> Option<usize> {
        match self {
            Padding::Valid if input < window => None,
            Padding::Valid => Some((input - window) / stride + 1),
            Padding::Same => Some((input + stride - 1) / stride),
        }
    }

    fn pad_before(self, input: usize, window: usize, stride: usize, output: usize) -> usize {
        match self {
            Padding::Valid => 0,
            Padding::Same => ((output.saturating_sub(1)) * stride + window).saturating_sub(input) / 2,
        }
    }
}

/// `kernel_size`, `strides`, `pool_size`: число или пара.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Window {
    Scalar(usize),
    Pair(Vec<usize>),
}

impl Window {
    fn pair(&self, layer: &str, field: &str) -> Result<(usize, usize)> {
        let (a, b) = match self {
            Window::Scalar(v) => (*v, *v),
            Window::Pair(v) if v.len() == 2 => (v[0], v[1]),
            Window::Pair(v) => {
                return Err(RuntimeError::InvalidArtifact(format!(
                    "{layer}: {field} must have 2 values, got {}",
                    v.len()
                )))
            }
        };
        if a == 0 || b == 0 {
            return Err(RuntimeError::InvalidArtifact(format!(
                "{layer}: {field} must be positive"
            )));
        }
        Ok((a, b))
    }
}

fn linear() -> String {
    "linear".to_string()
}

fn yes() -> bool {
    true
}

fn unit_window() -> Window {
    Window::Scalar(1)
}

fn pool_window() -> Window {
    Window::Scalar(2)
}

#[derive(Debug, Deserialize)]
struct DenseConfig {
    units: usize,
    #[serde(default = "linear")]
    activation: String,
    #[serde(default = "yes")]
    use_bias: bool,
}

#[derive(Debug, Deserialize)]
struct ReshapeConfig {
    target_shape: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct ActivationConfig {
    activation: String,
}

#[derive(Debug, Deserialize)]
struct Conv2DConfig {
    filters: usize,
    kernel_size: Window,
    #[serde(default = "unit_window")]
    strides: Window,
    #[serde(default)]
    padding: Padding,
    #[serde(default = "linear")]
    activation: String,
    #[serde(default = "yes")]
    use_bias: bool,
    #[serde(default)]
    data_format: Option<String>,
    #[serde(default)]
    dilation_rate: Option<Window>,
}

#[derive(Debug, Deserialize)]
struct PoolConfig {
    #[serde(default = "pool_window")]
    pool_size: Window,
    #[serde(default)]
    strides: Option<Window>,
    #[serde(default)]
    padding: Padding,
    #[serde(default)]
    data_format: Option<String>,
}

/// Описание слоя из `model.json` до привязки весов.
#[derive(Debug, Clone)]
pub struct LayerSpec {
    pub class_name: String,
    pub name: String,
    pub batch_input_shape: Option<Vec<Option<usize>>>,
    config: Value,
}

impl LayerSpec {
    pub fn from_value(index: usize, value: &Value) -> Result<Self> {
        let class_name = value
            .get("class_name")
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::InvalidArtifact(format!("layer #{index} has no class_name")))?
            .to_string();
        let config = value.get("config").cloned().unwrap_or(Value::Null);
        let name = config
            .get("name")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("{}_{index}", class_name.to_lowercase()));
        let batch_input_shape = match config.get("batch_input_shape").or_else(|| config.get("batch_shape")) {
            Some(Value::Null) | None => None,
            Some(v) => Some(serde_json::from_value::<Vec<Option<usize>>>(v.clone()).map_err(|e| {
                RuntimeError::InvalidArtifact(format!("{name}: batch_input_shape: {e}"))
            })?),
        };
        Ok(Self {
            class_name,
            name,
            batch_input_shape,
            config,
        })
    }

    fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.config.clone())
            .map_err(|e| RuntimeError::InvalidArtifact(format!("{} config: {e}", self.name)))
    }
}

/// Веса по именам (`<layer>/kernel`, возможно с префиксом `<model>/`).
#[derive(Debug, Default)]
pub(crate) struct WeightStore {
    tensors: HashMap<String, OwnedTensor>,
}

impl WeightStore {
    pub(crate) fn insert(&mut self, name: String, tensor: OwnedTensor) {
        self.tensors.insert(name, tensor);
    }

    fn take(&mut self, layer: &str, param: &str) -> Option<OwnedTensor> {
        let exact = format!("{layer}/{param}");
        if let Some(t) = self.tensors.remove(&exact) {
            return Some(t);
        }
        let suffix = format!("/{exact}");
        let key = self.tensors.keys().find(|k| k.ends_with(&suffix)).cloned()?;
        self.tensors.remove(&key)
    }

    fn require(&mut self, layer: &str, param: &str) -> Result<OwnedTensor> {
        self.take(layer, param)
            .ok_or_else(|| RuntimeError::MissingWeight(format!("{layer}/{param}")))
    }

    /// Имена весов, не привязанных ни к одному слою.
    pub(crate) fn leftover_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tensors.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Max,
    Average,
}

#[derive(Debug)]
enum LayerOp {
    Input,
    Dense {
        units: usize,
        activation: Activation,
        kernel: OwnedTensor,
        bias: Option<OwnedTensor>,
    },
    Flatten,
    Reshape {
        target: Vec<i64>,
    },
    Activation(Activation),
    Dropout,
    Conv2D {
        filters: usize,
        window: (usize, usize),
        strides: (usize, usize),
        padding: Padding,
        activation: Activation,
        kernel: OwnedTensor,
        bias: Option<OwnedTensor>,
    },
    Pool2D {
        kind: PoolKind,
        window: (usize, usize),
        strides: (usize, usize),
        padding: Padding,
    },
}

fn check_channels_last(layer: &str, data_format: Option<&str>) -> Result<()> {
    match data_format {
        None | Some("channels_last") => Ok(()),
        Some(other) => Err(RuntimeError::UnsupportedLayer(format!(
            "{layer}: data_format {other}"
        ))),
    }
}

fn check_bias(layer: &str, bias: &Option<OwnedTensor>, len: usize) -> Result<()> {
    match bias {
        Some(b) if b.shape() != [len] => Err(RuntimeError::shape(
            format!("{layer} bias"),
            &[len],
            b.shape(),
        )),
        _ => Ok(()),
    }
}

/// Слой с привязанными весами.
#[derive(Debug)]
pub struct Layer {
    name: String,
    class_name: String,
    op: LayerOp,
    output_shape: Option<Vec<usize>>,
}

impl Layer {
    pub(crate) fn from_spec(spec: &LayerSpec, weights: &mut WeightStore) -> Result<Self> {
        let name = spec.name.as_str();
        let op = match spec.class_name.as_str() {
            "InputLayer" => LayerOp::Input,
            "Dense" => {
                let c: DenseConfig = spec.parse()?;
                let activation = Activation::parse(&c.activation)?;
                let kernel = weights.require(name, "kernel")?;
                if kernel.rank() != 2 || kernel.shape()[1] != c.units {
                    return Err(RuntimeError::shape(
                        format!("{name} kernel"),
                        &[kernel.shape().first().copied().unwrap_or(0), c.units],
                        kernel.shape(),
                    ));
                }
                let bias = if c.use_bias {
                    Some(weights.require(name, "bias")?)
                } else {
                    None
                };
                check_bias(name, &bias, c.units)?;
                LayerOp::Dense {
                    units: c.units,
                    activation,
                    kernel,
                    bias,
                }
            }
            "Flatten" => LayerOp::Flatten,
            "Reshape" => {
                let c: ReshapeConfig = spec.parse()?;
                LayerOp::Reshape {
                    target: c.target_shape,
                }
            }
            "Activation" => {
                let c: ActivationConfig = spec.parse()?;
                LayerOp::Activation(Activation::parse(&c.activation)?)
            }
            "Dropout" => LayerOp::Dropout,
            "Conv2D" => {
                let c: Conv2DConfig = spec.parse()?;
                check_channels_last(name, c.data_format.as_deref())?;
                if let Some(d) = &c.dilation_rate {
                    if d.pair(name, "dilation_rate")? != (1, 1) {
                        return Err(RuntimeError::UnsupportedLayer(format!(
                            "{name}: dilated Conv2D"
                        )));
                    }
                }
                let window = c.kernel_size.pair(name, "kernel_size")?;
                let strides = c.strides.pair(name, "strides")?;
                let activation = Activation::parse(&c.activation)?;
                let kernel = weights.require(name, "kernel")?;
                let k = kernel.shape();
                if k.len() != 4 || k[0] != window.0 || k[1] != window.1 || k[3] != c.filters {
                    return Err(RuntimeError::shape(
                        format!("{name} kernel"),
                        &[window.0, window.1, k.get(2).copied().unwrap_or(0), c.filters],
                        k,
                    ));
                }
                let bias = if c.use_bias {
                    Some(weights.require(name, "bias")?)
                } else {
                    None
                };
                check_bias(name, &bias, c.filters)?;
                LayerOp::Conv2D {
                    filters: c.filters,
                    window,
                    strides,
                    padding: c.padding,
                    activation,
                    kernel,
                    bias,
                }
            }
            "MaxPooling2D" | "AveragePooling2D" => {
                let c: PoolConfig = spec.parse()?;
                check_channels_last(name, c.data_format.as_deref())?;
                let window = c.pool_size.pair(name, "pool_size")?;
                let strides = match &c.strides {
                    Some(s) => s.pair(name, "strides")?,
                    None => window,
                };
                let kind = if spec.class_name == "MaxPooling2D" {
                    PoolKind::Max
                } else {
                    PoolKind::Average
                };
                LayerOp::Pool2D {
                    kind,
                    window,
                    strides,
                    padding: c.padding,
                }
            }
            other => return Err(RuntimeError::UnsupportedLayer(other.to_string())),
        };
        Ok(Self {
            name: spec.name.clone(),
            class_name: spec.class_name.clone(),
            op,
            output_shape: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn output_shape(&self) -> Option<&[usize]> {
        self.output_shape.as_deref()
    }

    pub fn param_count(&self) -> usize {
        match &self.op {
            LayerOp::Dense { kernel, bias, .. } | LayerOp::Conv2D { kernel, bias, .. } => {
                kernel.size() + bias.as_ref().map_or(0, OwnedTensor::size)
            }
            _ => 0,
        }
    }

    /// Выводит форму выхода и запоминает её. Здесь же проверяются формы весов относительно входа.
    pub(crate) fn build(&mut self, input: &[usize]) -> Result<Vec<usize>> {
        let out = self.infer_shape(input)?;
        self.output_shape = Some(out.clone());
        Ok(out)
    }

    fn infer_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        let name = self.name.as_str();
        match &self.op {
            LayerOp::Input | LayerOp::Activation(_) | LayerOp::Dropout => Ok(input.to_vec()),
            LayerOp::Dense { units, kernel, .. } => {
                if input.len() < 2 {
                    return Err(RuntimeError::shape(format!("{name} input rank"), &[2], &[input.len()]));
                }
                let (features, lead) = input.split_last().ok_or(RuntimeError::NotBuilt)?;
                if kernel.shape()[0] != *features {
                    return Err(RuntimeError::shape(
                        format!("{name} kernel"),
                        &[*features, *units],
                        kernel.shape(),
                    ));
                }
                let mut out = lead.to_vec();
                out.push(*units);
                Ok(out)
            }
            LayerOp::Flatten => {
                let (batch, rest) = input
                    .split_first()
                    .ok_or_else(|| RuntimeError::shape(format!("{name} input rank"), &[2], &[0]))?;
                let features = element_count(rest).ok_or_else(|| {
                    RuntimeError::InvalidArtifact(format!("{name}: input {input:?} is too large to flatten"))
                })?;
                Ok(vec![*batch, features])
            }
            LayerOp::Reshape { target } => {
                let (batch, rest) = input
                    .split_first()
                    .ok_or_else(|| RuntimeError::shape(format!("{name} input rank"), &[2], &[0]))?;
                let mut out = vec![*batch];
                out.extend(resolve_target(name, rest, target)?);
                Ok(out)
            }
            LayerOp::Conv2D {
                filters,
                window,
                strides,
                padding,
                kernel,
                ..
            } => {
                let [batch, h, w, c] = rank4(name, input)?;
                if kernel.shape()[2] != c {
                    return Err(RuntimeError::shape(
                        format!("{name} kernel"),
                        &[window.0, window.1, c, *filters],
                        kernel.shape(),
                    ));
                }
                let (oh, ow) = spatial_out(name, h, w, *window, *strides, *padding)?;
                Ok(vec![batch, oh, ow, *filters])
            }
            LayerOp::Pool2D {
                window,
                strides,
                padding,
                ..
            } => {
                let [batch, h, w, c] = rank4(name, input)?;
                let (oh, ow) = spatial_out(name, h, w, *window, *strides, *padding)?;
                Ok(vec![batch, oh, ow, c])
            }
        }
    }

    pub(crate) fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let out_shape = self.output_shape.as_deref().ok_or(RuntimeError::NotBuilt)?;
        match &self.op {
            LayerOp::Input | LayerOp::Dropout => Ok(x.clone()),
            LayerOp::Activation(a) => {
                let mut y = x.clone();
                a.apply(&mut y);
                Ok(y)
            }
            LayerOp::Flatten | LayerOp::Reshape { .. } => {
                ArrayD::from_shape_vec(IxDyn(out_shape), x.iter().copied().collect()).map_err(exec)
            }
            LayerOp::Dense {
                activation,
                kernel,
                bias,
                ..
            } => dense(x, kernel, bias.as_ref(), *activation, out_shape),
            LayerOp::Conv2D {
                strides,
                padding,
                activation,
                kernel,
                bias,
                ..
            } => conv2d(x, kernel, bias.as_ref(), *strides, *padding, *activation, out_shape),
            LayerOp::Pool2D {
                kind,
                window,
                strides,
                padding,
            } => pool2d(x, *kind, *window, *strides, *padding, out_shape),
        }
    }
}

fn rank4(layer: &str, input: &[usize]) -> Result<[usize; 4]> {
    match input {
        [b, h, w, c] => Ok([*b, *h, *w, *c]),
        _ => Err(RuntimeError::shape(format!("{layer} input rank"), &[4], &[input.len()])),
    }
}

fn spatial_out(
    layer: &str,
    h: usize,
    w: usize,
    window: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
) -> Result<(usize, usize)> {
    let oh = padding.output_len(h, window.0, strides.0);
    let ow = padding.output_len(w, window.1, strides.1);
    match (oh, ow) {
        (Some(oh), Some(ow)) if oh > 0 && ow > 0 => Ok((oh, ow)),
        _ => Err(RuntimeError::shape(
            format!("{layer} window larger than input"),
            &[window.0, window.1],
            &[h, w],
        )),
    }
}

fn resolve_target(layer: &str, rest: &[usize], target: &[i64]) -> Result<Vec<usize>> {
    let total = element_count(rest)
        .ok_or_else(|| RuntimeError::InvalidArtifact(format!("{layer}: input {rest:?} is too large")))?;
    let unknown = target.iter().filter(|d| **d == -1).count();
    if unknown > 1 || target.iter().any(|d| *d == 0 || *d < -1) {
        return Err(RuntimeError::InvalidArtifact(format!(
            "{layer}: invalid target_shape {target:?}"
        )));
    }
    let known = target
        .iter()
        .filter(|d| **d > 0)
        .try_fold(1usize, |acc, d| usize::try_from(*d).ok().and_then(|d| acc.checked_mul(d)))
        .ok_or_else(|| RuntimeError::InvalidArtifact(format!("{layer}: target_shape {target:?} is too large")))?;
    let fill = if unknown == 1 {
        if known == 0 || total % known != 0 {
            return Err(RuntimeError::shape(format!("{layer} reshape"), &[total], &[known]));
        }
        total / known
    } else {
        if known != total {
            return Err(RuntimeError::shape(format!("{layer} reshape"), &[total], &[known]));
        }
        0
    };
    Ok(target
        .iter()
        .map(|d| if *d == -1 { fill } else { *d as usize })
        .collect())
}

fn dense(
    x: &ArrayD<f32>,
    kernel: &OwnedTensor,
    bias: Option<&OwnedTensor>,
    activation: Activation,
    out_shape: &[usize],
) -> Result<ArrayD<f32>> {
    let k = kernel.data().view().into_dimensionality::<Ix2>().map_err(exec)?;
    let features = k.nrows().max(1);
    let rows = x.len() / features;
    let x2 = Array2::from_shape_vec((rows, features), x.iter().copied().collect()).map_err(exec)?;
    let mut y = x2.dot(&k);
    if let Some(b) = bias {
        let b = b.data().view().into_dimensionality::<Ix1>().map_err(exec)?;
        y += &b;
    }
    let mut out = ArrayD::from_shape_vec(IxDyn(out_shape), y.into_raw_vec()).map_err(exec)?;
    activation.apply(&mut out);
    Ok(out)
}

fn conv2d(
    x: &ArrayD<f32>,
    kernel: &OwnedTensor,
    bias: Option<&OwnedTensor>,
    strides: (usize, usize),
    padding: Padding,
    activation: Activation,
    out_shape: &[usize],
) -> Result<ArrayD<f32>> {
    let x4 = x.view().into_dimensionality::<Ix4>().map_err(exec)?;
    let k4 = kernel.data().view().into_dimensionality::<Ix4>().map_err(exec)?;
    let (batch, h, w, channels) = x4.dim();
    let (kh, kw, _, filters) = k4.dim();
    let [_, oh, ow, _] = rank4("conv2d output", out_shape)?;
    let pad_top = padding.pad_before(h, kh, strides.0, oh);
    let pad_left = padding.pad_before(w, kw, strides.1, ow);
    let bias = bias.map(OwnedTensor::to_vec);

    let mut y = Array4::<f32>::zeros((batch, oh, ow, filters));
    for b in 0..batch {
        for i in 0..oh {
            for j in 0..ow {
                for f in 0..filters {
                    let mut acc = bias.as_ref().map_or(0.0, |bv| bv[f]);
                    for di in 0..kh {
                        let Some(ii) = (i * strides.0 + di).checked_sub(pad_top) else {
                            continue;
                        };
                        if ii >= h {
                            continue;
                        }
                        for dj in 0..kw {
                            let Some(jj) = (j * strides.1 + dj).checked_sub(pad_left) else {
                                continue;
                            };
                            if jj >= w {
                                continue;
                            }
                            for c in 0..channels {
                                acc += x4[[b, ii, jj, c]] * k4[[di, dj, c, f]];
                            }
                        }
                    }
                    y[[b, i, j, f]] = acc;
                }
            }
        }
    }
    let mut out = y.into_dyn();
    activation.apply(&mut out);
    Ok(out)
}

fn pool2d(
    x: &ArrayD<f32>,
    kind: PoolKind,
    window: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
    out_shape: &[usize],
) -> Result<ArrayD<f32>> {
    let x4 = x.view().into_dimensionality::<Ix4>().map_err(exec)?;
    let (batch, h, w, channels) = x4.dim();
    let [_, oh, ow, _] = rank4("pool output", out_shape)?;
    let pad_top = padding.pad_before(h, window.0, strides.0, oh);
    let pad_left = padding.pad_before(w, window.1, strides.1, ow);

    let mut y = Array4::<f32>::zeros((batch, oh, ow, channels));
    for b in 0..batch {
        for i in 0..oh {
            for j in 0..ow {
                for c in 0..channels {
                    let mut max = f32::NEG_INFINITY;
                    let mut sum = 0.0f32;
                    let mut count = 0usize;
                    for di in 0..window.0 {
                        let Some(ii) = (i * strides.0 + di).checked_sub(pad_top) else {
                            continue;
                        };
                        if ii >= h {
                            continue;
                        }
                        for dj in 0..window.1 {
                            let Some(jj) = (j * strides.1 + dj).checked_sub(pad_left) else {
                                continue;
                            };
                            if jj >= w {
                                continue;
                            }
                            let v = x4[[b, ii, jj, c]];
                            max = max.max(v);
                            sum += v;
                            count += 1;
                        }
                    }
                    y[[b, i, j, c]] = match kind {
                        PoolKind::Max => max,
                        PoolKind::Average if count > 0 => sum / count as f32,
                        PoolKind::Average => 0.0,
                    };
                }
            }
        }
    }
    Ok(y.into_dyn())
}
