//! 候选选择器
//!
//! 规则顺序：
//! 1. 名称精确匹配直接胜出（包括 alternative 绑定）
//! 2. 存在激活 profile 门控的候选时，只保留它们
//! 3. 唯一的 primary 胜出，多个 primary 为歧义
//! 4. 没有 primary 且剩余多个候选为歧义
//! 5. 任一阶段只剩一个候选即返回

use super::descriptor::BindingDescriptor;
use super::instance::ContractKey;
use crate::errors::ContainerError;
use crate::infrastructure::properties::ActiveProfiles;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CandidateSelector {
    profiles: ActiveProfiles,
}

impl CandidateSelector {
    pub fn new(profiles: ActiveProfiles) -> Self {
        Self { profiles }
    }

    pub fn profiles(&self) -> &ActiveProfiles {
        &self.profiles
    }

    /// 门控是否允许该绑定参与选择
    pub fn is_active(&self, binding: &BindingDescriptor) -> bool {
        self.profiles.admits(&binding.profiles)
    }

    /// 选出唯一的绑定；没有候选时返回 `Ok(None)`
    pub fn select(
        &self,
        contract: &ContractKey,
        name: Option<&str>,
        candidates: &[Arc<BindingDescriptor>],
    ) -> Result<Option<Arc<BindingDescriptor>>, ContainerError> {
        if let Some(name) = name {
            return Ok(candidates
                .iter()
                .find(|b| b.name.as_deref() == Some(name) && self.is_active(b))
                .cloned());
        }

        let remaining = self.narrow(candidates);
        match remaining.len() {
            0 => return Ok(None),
            1 => return Ok(remaining.into_iter().next()),
            _ => {}
        }

        let primaries: Vec<&Arc<BindingDescriptor>> =
            remaining.iter().filter(|b| b.primary).collect();
        match primaries.len() {
            1 => Ok(Some(primaries[0].clone())),
            0 => Err(ambiguous(contract, &remaining)),
            _ => Err(ambiguous(
                contract,
                &primaries.into_iter().cloned().collect::<Vec<_>>(),
            )),
        }
    }

    /// 集合注入：所有激活的非 alternative 候选，保持注册顺序
    pub fn select_all(&self, candidates: &[Arc<BindingDescriptor>]) -> Vec<Arc<BindingDescriptor>> {
        candidates
            .iter()
            .filter(|b| !b.alternative && self.is_active(b))
            .cloned()
            .collect()
    }

    fn narrow(&self, candidates: &[Arc<BindingDescriptor>]) -> Vec<Arc<BindingDescriptor>> {
        let eligible: Vec<Arc<BindingDescriptor>> = candidates
            .iter()
            .filter(|b| !b.alternative && self.is_active(b))
            .cloned()
            .collect();

        let gated: Vec<Arc<BindingDescriptor>> = eligible
            .iter()
            .filter(|b| !b.profiles.is_empty())
            .cloned()
            .collect();

        if gated.is_empty() {
            eligible
        } else {
            gated
        }
    }
}

fn ambiguous(contract: &ContractKey, tied: &[Arc<BindingDescriptor>]) -> ContainerError {
    ContainerError::AmbiguousBinding {
        contract: contract.name().to_string(),
        candidates: tied.iter().map(|b| b.label()).collect(),
    }
}
