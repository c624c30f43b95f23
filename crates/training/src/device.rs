//! Device selection and data-parallel model replicas.

use std::{fmt, str::FromStr};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use model::{ContrastiveModel, HeadOutput, ModelConfig, ModelKind};

use crate::{optimizer::NamedGradients, TrainingError};

/// Parsed `runtime.device_selector`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// First CUDA device, else first Metal device, else one CPU replica.
    Auto,
    /// `replicas` model copies on the host.
    Cpu { replicas: usize },
    Cuda(Vec<usize>),
    Metal(Vec<usize>),
}

impl FromStr for DeviceSelector {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_lowercase();
        let (kind, rest) = match value.split_once(':') {
            Some((kind, rest)) => (kind, Some(rest)),
            None => (value.as_str(), None),
        };
        let parse_ids = |rest: Option<&str>| -> Result<Vec<usize>, TrainingError> {
            let Some(rest) = rest else {
                return Ok(vec![0]);
            };
            let ids = rest
                .split(',')
                .map(|id| id.trim().parse::<usize>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| invalid(s))?;
            if ids.is_empty() {
                return Err(invalid(s));
            }
            let mut unique = ids.clone();
            unique.sort_unstable();
            unique.dedup();
            if unique.len() != ids.len() {
                return Err(TrainingError::ConfigFormat(format!(
                    "device selector '{s}' lists a device twice"
                )));
            }
            Ok(ids)
        };

        match (kind, rest) {
            ("auto", None) => Ok(Self::Auto),
            ("cpu", None) => Ok(Self::Cpu { replicas: 1 }),
            ("cpu", Some(count)) => match count.trim().parse::<usize>() {
                Ok(replicas) if replicas > 0 => Ok(Self::Cpu { replicas }),
                _ => Err(invalid(s)),
            },
            ("cuda" | "gpu", rest) => Ok(Self::Cuda(parse_ids(rest)?)),
            ("metal", rest) => Ok(Self::Metal(parse_ids(rest)?)),
            _ => Err(invalid(s)),
        }
    }
}

fn invalid(selector: &str) -> TrainingError {
    TrainingError::ConfigFormat(format!(
        "invalid device selector '{selector}'. Valid forms: auto, cpu, cpu:N, cuda[:0,1], metal[:0]"
    ))
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |ids: &[usize]| {
            ids.iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu { replicas: 1 } => write!(f, "cpu"),
            Self::Cpu { replicas } => write!(f, "cpu:{replicas}"),
            Self::Cuda(ids) => write!(f, "cuda:{}", join(ids)),
            Self::Metal(ids) => write!(f, "metal:{}", join(ids)),
        }
    }
}

impl DeviceSelector {
    /// Open every selected device. Explicitly requested accelerators that
    /// cannot be opened are an error; `auto` falls back to the CPU.
    pub fn resolve(&self) -> Result<Vec<Device>, TrainingError> {
        match self {
            Self::Auto => {
                if let Ok(device) = Device::new_cuda(0) {
                    tracing::info!("auto-selected CUDA device 0");
                    return Ok(vec![device]);
                }
                if let Ok(device) = Device::new_metal(0) {
                    tracing::info!("auto-selected Metal device 0");
                    return Ok(vec![device]);
                }
                tracing::info!("auto-selected CPU");
                Ok(vec![Device::Cpu])
            }
            Self::Cpu { replicas } => Ok(vec![Device::Cpu; *replicas]),
            Self::Cuda(ids) => ids
                .iter()
                .map(|id| {
                    Device::new_cuda(*id).map_err(|err| {
                        TrainingError::device_sync(format!("cannot open cuda:{id}: {err}"))
                    })
                })
                .collect(),
            Self::Metal(ids) => ids
                .iter()
                .map(|id| {
                    Device::new_metal(*id).map_err(|err| {
                        TrainingError::device_sync(format!("cannot open metal:{id}: {err}"))
                    })
                })
                .collect(),
        }
    }
}

/// One model copy and its parameters on one device.
pub struct Replica {
    device: Device,
    varmap: VarMap,
    model: ContrastiveModel,
}

impl Replica {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn model(&self) -> &ContrastiveModel {
        &self.model
    }
}

/// Data-parallel group of identical replicas. Replica 0 is the primary: it
/// owns the optimizer's parameters and receives gathered outputs and
/// gradients.
pub struct DeviceGroup {
    replicas: Vec<Replica>,
}

impl DeviceGroup {
    pub fn new(config: &ModelConfig, kind: ModelKind, devices: Vec<Device>) -> Result<Self, TrainingError> {
        if devices.is_empty() {
            return Err(TrainingError::initialization("device group needs at least one device"));
        }
        let mut replicas = Vec::with_capacity(devices.len());
        for device in devices {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let model = ContrastiveModel::build(config, kind, vb)?;
            replicas.push(Replica {
                device,
                varmap,
                model,
            });
        }
        let group = Self { replicas };
        group.broadcast_parameters()?;
        Ok(group)
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn primary(&self) -> &Replica {
        &self.replicas[0]
    }

    pub fn primary_device(&self) -> &Device {
        &self.replicas[0].device
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    /// Primary parameters in name order.
    pub fn named_parameters(&self) -> Result<Vec<(String, Var)>, TrainingError> {
        named_vars(&self.replicas[0].varmap)
    }

    /// Contiguous row ranges, one per replica that receives rows.
    fn shards(&self, batch: usize) -> Vec<(usize, usize, usize)> {
        let parts = self.replicas.len().min(batch).max(1);
        let base = batch / parts;
        let extra = batch % parts;
        let mut start = 0;
        (0..parts)
            .map(|index| {
                let len = base + usize::from(index < extra);
                let shard = (index, start, len);
                start += len;
                shard
            })
            .collect()
    }

    /// Split the batch across replicas, run each shard, and concatenate the
    /// outputs on the primary device in batch order. The concatenation stays
    /// on the autograd graph, so one backward pass reaches every replica.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<HeadOutput, TrainingError> {
        let (batch, _) = input_ids.dims2()?;
        let primary = self.primary_device();
        let mut outputs = Vec::with_capacity(self.replicas.len());
        for (index, start, len) in self.shards(batch) {
            let replica = &self.replicas[index];
            let ids = input_ids.narrow(0, start, len)?.to_device(&replica.device)?;
            let mask = attention_mask.narrow(0, start, len)?.to_device(&replica.device)?;
            outputs.push(replica.model.forward(&ids, &mask, train)?);
        }

        if outputs.len() == 1 {
            let output = outputs.remove(0);
            return Ok(HeadOutput {
                representations: to_device_all(&output.representations, primary)?,
                logits: to_device_all(&output.logits, primary)?,
                levels: output.levels,
            });
        }

        Ok(HeadOutput {
            representations: concat_rows(
                outputs.iter().map(|output| &output.representations).collect(),
                primary,
            )?,
            logits: concat_rows(outputs.iter().map(|output| &output.logits).collect(), primary)?,
            levels: outputs[0].levels.clone(),
        })
    }

    /// Sum every parameter's gradient over the replicas that took part in the
    /// backward pass, on the primary device. A parameter with a gradient on
    /// some of those replicas but not others is a synchronization failure.
    pub fn gather_gradients(&self, grads: &GradStore, batch: usize) -> Result<NamedGradients, TrainingError> {
        let active: Vec<&Replica> = self
            .shards(batch)
            .into_iter()
            .map(|(index, _, _)| &self.replicas[index])
            .collect();
        let per_replica = active
            .iter()
            .map(|replica| named_vars(&replica.varmap))
            .collect::<Result<Vec<_>, _>>()?;

        let primary = self.primary_device();
        let mut gathered = NamedGradients::new();
        for (position, (name, _)) in per_replica[0].iter().enumerate() {
            let mut parts = Vec::with_capacity(active.len());
            for (replica, vars) in per_replica.iter().enumerate() {
                let (other_name, var) = vars.get(position).ok_or_else(|| {
                    TrainingError::device_sync(format!("replica {replica} is missing parameter '{name}'"))
                })?;
                if other_name != name {
                    return Err(TrainingError::device_sync(format!(
                        "replica {replica} parameter order diverged at '{name}'"
                    )));
                }
                if let Some(grad) = grads.get(var.as_tensor()) {
                    parts.push((replica, grad.to_device(primary)?));
                }
            }
            if parts.is_empty() {
                continue;
            }
            if parts.len() != active.len() {
                let have: Vec<usize> = parts.iter().map(|(replica, _)| *replica).collect();
                return Err(TrainingError::device_sync(format!(
                    "gradient for '{name}' only present on replicas {have:?} of {}",
                    active.len()
                )));
            }
            let mut iter = parts.into_iter().map(|(_, grad)| grad);
            let mut sum = iter
                .next()
                .ok_or_else(|| TrainingError::device_sync("empty gradient set"))?;
            for grad in iter {
                sum = sum.add(&grad)?;
            }
            gathered.insert(name.clone(), sum);
        }
        Ok(gathered)
    }

    /// Copy the primary's parameter values onto every other replica.
    pub fn broadcast_parameters(&self) -> Result<(), TrainingError> {
        let source = named_vars(&self.replicas[0].varmap)?;
        for (index, replica) in self.replicas.iter().enumerate().skip(1) {
            let target = named_vars(&replica.varmap)?;
            if target.len() != source.len() {
                return Err(TrainingError::device_sync(format!(
                    "replica {index} has {} parameters, primary has {}",
                    target.len(),
                    source.len()
                )));
            }
            for ((name, from), (other, to)) in source.iter().zip(&target) {
                if name != other {
                    return Err(TrainingError::device_sync(format!(
                        "replica {index} parameter '{other}' does not match '{name}'"
                    )));
                }
                to.set(&from.as_tensor().to_device(&replica.device)?)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>, TrainingError> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| TrainingError::runtime("parameter map lock poisoned"))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Concatenate slot `i` of every shard along the batch axis.
fn concat_rows(shards: Vec<&Vec<Tensor>>, device: &Device) -> Result<Vec<Tensor>, TrainingError> {
    let slots = shards.first().map_or(0, |shard| shard.len());
    (0..slots)
        .map(|slot| {
            let parts = shards
                .iter()
                .map(|shard| shard[slot].to_device(device))
                .collect::<candle_core::Result<Vec<_>>>()?;
            Ok(Tensor::cat(&parts, 0)?)
        })
        .collect()
}

fn to_device_all(tensors: &[Tensor], device: &Device) -> Result<Vec<Tensor>, TrainingError> {
    Ok(tensors
        .iter()
        .map(|tensor| tensor.to_device(device))
        .collect::<candle_core::Result<Vec<_>>>()?)
}
