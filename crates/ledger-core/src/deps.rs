//! # Entity Dependency Ranking
//!
//! Both drivers order their work so parent entities land before children
//! that reference them by foreign key: the upstream driver drains the
//! outbox in this order, the downstream driver applies pulled rows in it.
//!
//! The graph is flattened into a static rank table. Entity types missing
//! from the table take a default rank placing them after all listed types;
//! sorting is stable, so FIFO order is preserved within a rank.

// =============================================================================
// Rank Table
// =============================================================================

/// Authoritative parent-before-child ordering for all known entity types.
///
/// When a new entity type is added this table must be updated; unknown
/// types sort last, which can cause FK inversions during downstream
/// apply. That window is tolerated because FK enforcement is suspended
/// for the apply scope.
pub const DEPENDENCY_ORDER: &[&str] = &[
    "accounts",
    "contacts",
    "vendors",
    "categories",
    "projects",
    "buildings",
    "properties",
    "units",
    "plan_amenities",
    "documents",
    "budgets",
    "rental_agreements",
    "project_agreements",
    "contracts",
    "invoices",
    "bills",
    "quotations",
    "transactions",
    "recurring_invoice_templates",
    "pm_cycle_allocations",
    "installment_plans",
    "sales_returns",
    "payroll_departments",
    "payroll_grades",
    "payroll_salary_components",
    "payroll_employees",
    "payroll_runs",
    "payslips",
];

/// Rank assigned to entity types not present in [`DEPENDENCY_ORDER`].
pub fn default_rank() -> usize {
    DEPENDENCY_ORDER.len()
}

/// Returns the dependency rank for an entity type.
pub fn dependency_rank(entity_type: &str) -> usize {
    DEPENDENCY_ORDER
        .iter()
        .position(|t| *t == entity_type)
        .unwrap_or_else(default_rank)
}

// =============================================================================
// Ordering Helpers
// =============================================================================

/// Stable-sorts `items` by the dependency rank of the entity type that
/// `entity_type_of` extracts. Relative order within a rank is preserved.
pub fn sort_by_dependency<T, F>(items: &mut [T], entity_type_of: F)
where
    F: Fn(&T) -> &str,
{
    items.sort_by_key(|item| dependency_rank(entity_type_of(item)));
}
