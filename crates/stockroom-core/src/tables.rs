//! # Synced Table Registry
//!
//! The static description of every table the engine is allowed to sync.
//!
//! ## Dependency DAG
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Retail Table Dependencies                          │
//! │                                                                         │
//! │  Level 0   categories · suppliers · customers · users                   │
//! │                             │                                           │
//! │                             ▼                                           │
//! │  Level 1   products · sales · purchases · expenses                      │
//! │                             │                                           │
//! │                             ▼                                           │
//! │  Level 2   sale_items · purchase_items · inventory_movements · returns  │
//! │                             │                                           │
//! │                             ▼                                           │
//! │  Level 3   return_items                                                 │
//! │                                                                         │
//! │  Push order = level order. A child is never pushed in a run before     │
//! │  its parents have had their chance to be mapped.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Typed Dispatch
//! Tables are addressed through [`EntityKind`]; the string name only appears
//! at the storage and wire boundaries, and is validated on the way in.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

// =============================================================================
// Entity Kind
// =============================================================================

/// Every synced table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Category,
    Supplier,
    Customer,
    User,
    Product,
    Sale,
    Purchase,
    Expense,
    SaleItem,
    PurchaseItem,
    InventoryMovement,
    Return,
    ReturnItem,
}

impl EntityKind {
    /// All kinds, in declaration order.
    pub const ALL: [EntityKind; 13] = [
        EntityKind::Category,
        EntityKind::Supplier,
        EntityKind::Customer,
        EntityKind::User,
        EntityKind::Product,
        EntityKind::Sale,
        EntityKind::Purchase,
        EntityKind::Expense,
        EntityKind::SaleItem,
        EntityKind::PurchaseItem,
        EntityKind::InventoryMovement,
        EntityKind::Return,
        EntityKind::ReturnItem,
    ];

    /// The static description of this table.
    pub fn spec(self) -> &'static TableSpec {
        // SPECS is declared in ALL order
        &SPECS[self as usize]
    }

    /// Table name used locally and remotely.
    pub fn table_name(self) -> &'static str {
        self.spec().name
    }

    /// Dependency level: 0 for root tables, 1 + max(parent level) otherwise.
    pub fn level(self) -> u8 {
        self.spec()
            .foreign_keys
            .iter()
            .map(|fk| fk.parent.level() + 1)
            .max()
            .unwrap_or(0)
    }

    /// Root tables have no foreign keys.
    pub fn is_root(self) -> bool {
        self.spec().foreign_keys.is_empty()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for EntityKind {
    type Err = CoreError;

    /// Parses a table name, rejecting deny-listed and unknown tables.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        if is_denied(name) {
            return Err(CoreError::DeniedTable(name.to_string()));
        }
        EntityKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.table_name() == name)
            .ok_or_else(|| CoreError::UnknownTable(name.to_string()))
    }
}

// =============================================================================
// Table Spec
// =============================================================================

/// A foreign-key column and the table it points at.
#[derive(Debug, Clone, Copy)]
pub struct ForeignKey {
    pub field: &'static str,
    pub parent: EntityKind,
    /// Optional keys may be null; required keys must resolve before a push.
    pub required: bool,
}

/// Static description of one synced table.
#[derive(Debug)]
pub struct TableSpec {
    pub kind: EntityKind,
    pub name: &'static str,
    /// Local columns, `id` first. Inserts and updates only touch these.
    pub columns: &'static [&'static str],
    pub foreign_keys: &'static [ForeignKey],
    /// Unique business key used as the PATCH filter for non-UUID local ids.
    pub natural_key: Option<&'static str>,
    /// JSON-typed columns: TEXT locally, native JSON remotely.
    pub json_columns: &'static [&'static str],
    /// Integer 0/1 flags locally, booleans remotely.
    pub bool_columns: &'static [&'static str],
    /// Tables without `updated_at` must never have one injected.
    pub has_updated_at: bool,
    /// `(remote, local)` pairs for columns named differently in the cloud.
    pub renames: &'static [(&'static str, &'static str)],
}

impl TableSpec {
    /// Column used to enumerate changes: `updated_at` when present,
    /// `created_at` otherwise.
    pub fn change_timestamp_column(&self) -> &'static str {
        if self.has_updated_at {
            crate::UPDATED_AT
        } else {
            crate::CREATED_AT
        }
    }

    /// Returns true if the table has a column of that local name.
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(&column)
    }

    /// Foreign key declared on `field`, if any.
    pub fn foreign_key(&self, field: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.field == field)
    }
}

const fn fk(field: &'static str, parent: EntityKind) -> ForeignKey {
    ForeignKey {
        field,
        parent,
        required: true,
    }
}

const fn optional_fk(field: &'static str, parent: EntityKind) -> ForeignKey {
    ForeignKey {
        field,
        parent,
        required: false,
    }
}

static SPECS: [TableSpec; 13] = [
    TableSpec {
        kind: EntityKind::Category,
        name: "categories",
        columns: &["id", "name", "description", "created_at", "updated_at", "deleted_at"],
        foreign_keys: &[],
        natural_key: Some("name"),
        json_columns: &[],
        bool_columns: &[],
        has_updated_at: true,
        renames: &[],
    },
    TableSpec {
        kind: EntityKind::Supplier,
        name: "suppliers",
        columns: &[
            "id", "name", "contact_name", "phone", "email", "address",
            "created_at", "updated_at", "deleted_at",
        ],
        foreign_keys: &[],
        natural_key: None,
        json_columns: &[],
        bool_columns: &[],
        has_updated_at: true,
        renames: &[],
    },
    TableSpec {
        kind: EntityKind::Customer,
        name: "customers",
        columns: &[
            "id", "name", "phone", "email", "address", "loyalty_points",
            "created_at", "updated_at", "deleted_at",
        ],
        foreign_keys: &[],
        natural_key: None,
        json_columns: &[],
        bool_columns: &[],
        has_updated_at: true,
        renames: &[],
    },
    TableSpec {
        kind: EntityKind::User,
        name: "users",
        columns: &[
            "id", "username", "full_name", "role", "password_hash", "is_active",
            "permissions", "created_at", "updated_at", "deleted_at",
        ],
        foreign_keys: &[],
        natural_key: Some("username"),
        json_columns: &["permissions"],
        bool_columns: &["is_active"],
        has_updated_at: true,
        renames: &[("display_name", "full_name")],
    },
    TableSpec {
        kind: EntityKind::Product,
        name: "products",
        columns: &[
            "id", "sku", "barcode", "name", "description", "category_id", "supplier_id",
            "price_cents", "cost_cents", "stock_quantity", "reorder_level", "is_active",
            "attributes", "created_at", "updated_at", "deleted_at",
        ],
        foreign_keys: &[
            optional_fk("category_id", EntityKind::Category),
            optional_fk("supplier_id", EntityKind::Supplier),
        ],
        natural_key: Some("sku"),
        json_columns: &["attributes"],
        bool_columns: &["is_active"],
        has_updated_at: true,
        renames: &[],
    },
    TableSpec {
        kind: EntityKind::Sale,
        name: "sales",
        columns: &[
            "id", "receipt_number", "customer_id", "user_id", "subtotal_cents", "tax_cents",
            "discount_cents", "total_cents", "payment_method", "status",
            "created_at", "updated_at", "deleted_at",
        ],
        foreign_keys: &[
            optional_fk("customer_id", EntityKind::Customer),
            fk("user_id", EntityKind::User),
        ],
        natural_key: Some("receipt_number"),
        json_columns: &[],
        bool_columns: &[],
        has_updated_at: true,
        renames: &[],
    },
    TableSpec {
        kind: EntityKind::Purchase,
        name: "purchases",
        columns: &[
            "id", "reference_number", "supplier_id", "user_id", "total_cents", "status",
            "received_at", "created_at", "updated_at", "deleted_at",
        ],
        foreign_keys: &[
            fk("supplier_id", EntityKind::Supplier),
            fk("user_id", EntityKind::User),
        ],
        natural_key: Some("reference_number"),
        json_columns: &[],
        bool_columns: &[],
        has_updated_at: true,
        renames: &[],
    },
    TableSpec {
        kind: EntityKind::Expense,
        name: "expenses",
        columns: &[
            "id", "user_id", "category", "description", "amount_cents", "expense_date",
            "created_at", "updated_at", "deleted_at",
        ],
        foreign_keys: &[fk("user_id", EntityKind::User)],
        natural_key: None,
        json_columns: &[],
        bool_columns: &[],
        has_updated_at: true,
        renames: &[],
    },
    TableSpec {
        kind: EntityKind::SaleItem,
        name: "sale_items",
        columns: &[
            "id", "sale_id", "product_id", "quantity", "unit_price_cents", "discount_cents",
            "total_cents", "created_at", "deleted_at",
        ],
        foreign_keys: &[
            fk("sale_id", EntityKind::Sale),
            fk("product_id", EntityKind::Product),
        ],
        natural_key: None,
        json_columns: &[],
        bool_columns: &[],
        has_updated_at: false,
        renames: &[],
    },
    TableSpec {
        kind: EntityKind::PurchaseItem,
        name: "purchase_items",
        columns: &[
            "id", "purchase_id", "product_id", "quantity", "unit_cost_cents", "total_cents",
            "created_at", "deleted_at",
        ],
        foreign_keys: &[
            fk("purchase_id", EntityKind::Purchase),
            fk("product_id", EntityKind::Product),
        ],
        natural_key: None,
        json_columns: &[],
        bool_columns: &[],
        has_updated_at: false,
        renames: &[],
    },
    TableSpec {
        kind: EntityKind::InventoryMovement,
        name: "inventory_movements",
        columns: &[
            "id", "product_id", "user_id", "movement_type", "quantity", "reason",
            "reference_id", "created_at", "deleted_at",
        ],
        foreign_keys: &[
            fk("product_id", EntityKind::Product),
            optional_fk("user_id", EntityKind::User),
        ],
        natural_key: None,
        json_columns: &[],
        bool_columns: &[],
        has_updated_at: false,
        renames: &[],
    },
    TableSpec {
        kind: EntityKind::Return,
        name: "returns",
        columns: &[
            "id", "sale_id", "customer_id", "user_id", "reason", "total_cents", "status",
            "created_at", "updated_at", "deleted_at",
        ],
        foreign_keys: &[
            fk("sale_id", EntityKind::Sale),
            optional_fk("customer_id", EntityKind::Customer),
            fk("user_id", EntityKind::User),
        ],
        natural_key: None,
        json_columns: &[],
        bool_columns: &[],
        has_updated_at: true,
        renames: &[],
    },
    TableSpec {
        kind: EntityKind::ReturnItem,
        name: "return_items",
        columns: &[
            "id", "return_id", "product_id", "quantity", "refund_cents", "created_at",
            "deleted_at",
        ],
        foreign_keys: &[
            fk("return_id", EntityKind::Return),
            fk("product_id", EntityKind::Product),
        ],
        natural_key: None,
        json_columns: &[],
        bool_columns: &[],
        has_updated_at: false,
        renames: &[],
    },
];

// =============================================================================
// Deny-list and Ordering
// =============================================================================

/// Tables that must never be synced: local configuration, security and
/// license logs, and the sync bookkeeping tables themselves.
pub const DENIED_TABLES: &[&str] = &[
    "app_settings",
    "license_activations",
    "security_logs",
    "sync_queue",
    "sync_metadata",
    "id_mappings",
    "pending_remote_changes",
    "_sqlx_migrations",
];

/// Returns true if `table` is on the deny-list.
pub fn is_denied(table: &str) -> bool {
    DENIED_TABLES.contains(&table)
}

/// Every synced table in push order: by dependency level, then declaration.
pub fn sync_order() -> Vec<EntityKind> {
    let mut kinds = EntityKind::ALL.to_vec();
    // stable sort keeps declaration order within a level
    kinds.sort_by_key(|kind| kind.level());
    kinds
}

/// Tables without foreign keys.
pub fn root_tables() -> Vec<EntityKind> {
    EntityKind::ALL
        .iter()
        .copied()
        .filter(|kind| kind.is_root())
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
