//! Domain entities owned by the Governor, Router, Tier Resolver, and
//! Evolution Engine. All implement [`store::Record`] and persist through
//! the store's generic collection API.

mod quota;
mod router_profile;
mod session_budget;
mod skill;
mod tier;

pub use quota::{ApiUsageRecord, Period, ProviderQuotaConfig, QuotaStatus, QuotaStatusKind, QuotaType};
pub use router_profile::{RouterModelProfile, RoutingDecision};
pub use session_budget::{BudgetCheck, BudgetStatusKind, SessionBudget};
pub use skill::Skill;
pub use tier::{Tier1Category, Tier2Entry, TierOverride, TierRegistry};
