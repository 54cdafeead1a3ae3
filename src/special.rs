//! Reserved `$` parameter names and how they resolve.

/// Header bytes of the work unit being hashed.
pub const WORK_DATA: &str = "$wuData";
/// Share target and candidate capacity for the current batch.
pub const DISPATCH_DATA: &str = "$dispatchData";
/// Counter-prefixed list of nonces a search kernel found.
pub const CANDIDATES: &str = "$candidates";
pub const STAGE_INPUT: &str = "$stageIn";
pub const STAGE_OUTPUT: &str = "$stageOut";

/// How a reserved name is provided to a kernel.
///
/// `Early` memory is bound once while the kernel is set up. `Late` names a
/// slot of the array passed to every dispatch, so the bound object can change
/// between iterations without rebuilding anything.
#[derive(Debug)]
pub enum SpecialBinding<'a, M> {
    Early(&'a M),
    Late(usize),
}

pub trait SpecialValueResolver<M> {
    fn resolve(&self, name: &str) -> Option<SpecialBinding<'_, M>>;
}

/// Resolver for algorithms without host-provided values.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSpecials;

impl<M> SpecialValueResolver<M> for NoSpecials {
    fn resolve(&self, _name: &str) -> Option<SpecialBinding<'_, M>> {
        None
    }
}

/// Chained-stage input and output, swapped by the caller between iterations.
#[derive(Debug, Default, Clone, Copy)]
pub struct StageSlots;

impl StageSlots {
    pub const INPUT: usize = 0;
    pub const OUTPUT: usize = 1;
}

impl<M> SpecialValueResolver<M> for StageSlots {
    fn resolve(&self, name: &str) -> Option<SpecialBinding<'_, M>> {
        match name {
            STAGE_INPUT => Some(SpecialBinding::Late(Self::INPUT)),
            STAGE_OUTPUT => Some(SpecialBinding::Late(Self::OUTPUT)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_slots_resolve_late() {
        let resolver = StageSlots;
        assert!(matches!(
            SpecialValueResolver::<u32>::resolve(&resolver, STAGE_INPUT),
            Some(SpecialBinding::Late(0))
        ));
        assert!(matches!(
            SpecialValueResolver::<u32>::resolve(&resolver, STAGE_OUTPUT),
            Some(SpecialBinding::Late(1))
        ));
        assert!(SpecialValueResolver::<u32>::resolve(&resolver, WORK_DATA).is_none());
        assert!(SpecialValueResolver::<u32>::resolve(&NoSpecials, STAGE_INPUT).is_none());
    }
}
