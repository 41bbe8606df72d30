use std::collections::HashMap;

use modelport_core::InferenceError;
use ndarray::{Array2, ArrayD, ArrayView1, Axis, Ix1, Ix2, Ix4, IxDyn, Zip};

use crate::graph::{checked_numel, Node};

pub(crate) struct Env<'a> {
    pub values: &'a HashMap<&'a str, ArrayD<f32>>,
    pub constants: &'a HashMap<String, ArrayD<f32>>,
}

impl Env<'_> {
    fn get(&self, name: &str) -> Result<&ArrayD<f32>, InferenceError> {
        self.values
            .get(name)
            .or_else(|| self.constants.get(name))
            .ok_or_else(|| InferenceError::Execution(format!("value `{name}` is undefined")))
    }
}

pub(crate) fn eval(node: &Node, env: &Env<'_>) -> Result<ArrayD<f32>, InferenceError> {
    match node {
        Node::Identity { input, .. } => Ok(env.get(input)?.clone()),
        Node::GlobalAveragePool { input, output } => global_average_pool(env.get(input)?, output),
        Node::Gemm {
            input,
            weight,
            bias,
            output,
        } => {
            let bias = bias.as_deref().map(|b| env.get(b)).transpose()?;
            gemm(env.get(input)?, env.get(weight)?, bias, output)
        }
        Node::Reshape {
            input,
            shape,
            output,
        } => reshape(env.get(input)?, shape, output),
        Node::Softmax { input, output } => softmax(env.get(input)?, output),
        Node::Sigmoid { input, .. } => Ok(env.get(input)?.mapv(|v| 1.0 / (1.0 + (-v).exp()))),
        Node::Add { lhs, rhs, output } => {
            broadcast_binary(env.get(lhs)?, env.get(rhs)?, output, |a, b| a + b)
        }
        Node::Mul { lhs, rhs, output } => {
            broadcast_binary(env.get(lhs)?, env.get(rhs)?, output, |a, b| a * b)
        }
    }
}

fn global_average_pool(x: &ArrayD<f32>, output: &str) -> Result<ArrayD<f32>, InferenceError> {
    let x = x
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| op_shape(output, "[N, C, H, W]", x.shape()))?;
    let (n, c, h, w) = x.dim();
    if h * w == 0 {
        return Err(op_shape(output, "non-empty spatial dims", &[n, c, h, w]));
    }

    let area = (h * w) as f32;
    let mut out = Array2::<f32>::zeros((n, c));
    for (b, image) in x.outer_iter().enumerate() {
        for (ch, plane) in image.outer_iter().enumerate() {
            out[[b, ch]] = plane.sum() / area;
        }
    }
    Ok(out.into_dyn())
}

fn gemm(
    x: &ArrayD<f32>,
    w: &ArrayD<f32>,
    bias: Option<&ArrayD<f32>>,
    output: &str,
) -> Result<ArrayD<f32>, InferenceError> {
    let x = x
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| op_shape(output, "input [N, K]", x.shape()))?;
    let w = w
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| op_shape(output, "weight [K, M]", w.shape()))?;
    if x.ncols() != w.nrows() {
        return Err(op_shape(
            output,
            &format!("weight with {} rows", x.ncols()),
            w.shape(),
        ));
    }

    let mut y = x.dot(&w);
    if let Some(bias) = bias {
        let bias: ArrayView1<'_, f32> = bias
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|_| op_shape(output, "bias [M]", bias.shape()))?;
        if bias.len() != y.ncols() {
            return Err(op_shape(
                output,
                &format!("bias of length {}", y.ncols()),
                bias.shape(),
            ));
        }
        y += &bias;
    }
    Ok(y.into_dyn())
}

fn reshape(x: &ArrayD<f32>, shape: &[usize], output: &str) -> Result<ArrayD<f32>, InferenceError> {
    let numel = checked_numel(shape)
        .ok_or_else(|| op_shape(output, &format!("representable target {shape:?}"), x.shape()))?;
    if numel != x.len() {
        return Err(op_shape(
            output,
            &format!("{numel} elements for target {shape:?}"),
            x.shape(),
        ));
    }
    ArrayD::from_shape_vec(IxDyn(shape), x.iter().copied().collect())
        .map_err(|e| InferenceError::Execution(format!("reshape to `{output}`: {e}")))
}

fn softmax(x: &ArrayD<f32>, output: &str) -> Result<ArrayD<f32>, InferenceError> {
    if x.ndim() == 0 {
        return Err(op_shape(output, "rank >= 1", x.shape()));
    }
    let mut out = x.clone();
    let axis = Axis(out.ndim() - 1);
    for mut lane in out.lanes_mut(axis) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        if sum > 0.0 {
            lane.mapv_inplace(|v| v / sum);
        }
    }
    Ok(out)
}

fn broadcast_binary(
    lhs: &ArrayD<f32>,
    rhs: &ArrayD<f32>,
    output: &str,
    f: impl Fn(f32, f32) -> f32,
) -> Result<ArrayD<f32>, InferenceError> {
    let shape = broadcast_shape(lhs.shape(), rhs.shape()).ok_or_else(|| {
        InferenceError::Execution(format!(
            "`{output}`: shapes {:?} and {:?} do not broadcast",
            lhs.shape(),
            rhs.shape()
        ))
    })?;
    let not_broadcastable =
        || InferenceError::Execution(format!("`{output}`: broadcast to {shape:?} failed"));
    let a = lhs.broadcast(IxDyn(&shape)).ok_or_else(not_broadcastable)?;
    let b = rhs.broadcast(IxDyn(&shape)).ok_or_else(not_broadcastable)?;
    Ok(Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y)))
}

fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |s: &[usize], i: usize| {
        let offset = rank - s.len();
        if i < offset {
            1
        } else {
            s[i - offset]
        }
    };
    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

fn op_shape(output: &str, expected: &str, actual: &[usize]) -> InferenceError {
    InferenceError::ShapeMismatch {
        name: output.to_string(),
        expected: expected.to_string(),
        actual: actual.to_vec(),
    }
}
