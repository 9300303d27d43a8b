use crate::store::ColumnSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationAction {
    CreateTable {
        table: &'static str,
        columns: &'static [ColumnSpec],
    },
    AddColumn {
        table: &'static str,
        column: ColumnSpec,
    },
    SeedSetting {
        key: &'static str,
        value: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStep {
    pub id: &'static str,
    pub action: MigrationAction,
}

const SETTINGS_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("key", "TEXT PRIMARY KEY NOT NULL"),
    ColumnSpec::new("value", "TEXT"),
];

const MENUS_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("id", "INTEGER PRIMARY KEY AUTOINCREMENT"),
    ColumnSpec::new("name", "TEXT NOT NULL"),
    ColumnSpec::new("location", "TEXT"),
];

const MENU_ITEMS_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("id", "INTEGER PRIMARY KEY AUTOINCREMENT"),
    ColumnSpec::new("menu_id", "INTEGER NOT NULL REFERENCES menus(id)"),
    ColumnSpec::new("label", "TEXT NOT NULL"),
    ColumnSpec::new("url", "TEXT NOT NULL"),
    ColumnSpec::new("position", "INTEGER NOT NULL DEFAULT 0"),
];

// Order matters: settings must exist before any SeedSetting step runs.
pub const MIGRATION_STEPS: &[MigrationStep] = &[
    MigrationStep {
        id: "create_settings",
        action: MigrationAction::CreateTable {
            table: "settings",
            columns: SETTINGS_COLUMNS,
        },
    },
    MigrationStep {
        id: "create_menus",
        action: MigrationAction::CreateTable {
            table: "menus",
            columns: MENUS_COLUMNS,
        },
    },
    MigrationStep {
        id: "create_menu_items",
        action: MigrationAction::CreateTable {
            table: "menu_items",
            columns: MENU_ITEMS_COLUMNS,
        },
    },
    MigrationStep {
        id: "posts_featured_image",
        action: MigrationAction::AddColumn {
            table: "posts",
            column: ColumnSpec::new("featured_image", "TEXT"),
        },
    },
    MigrationStep {
        id: "posts_meta_description",
        action: MigrationAction::AddColumn {
            table: "posts",
            column: ColumnSpec::new("meta_description", "TEXT"),
        },
    },
    MigrationStep {
        id: "comments_status",
        action: MigrationAction::AddColumn {
            table: "comments",
            column: ColumnSpec::new("status", "TEXT NOT NULL DEFAULT 'approved'"),
        },
    },
    MigrationStep {
        id: "media_alt_text",
        action: MigrationAction::AddColumn {
            table: "media",
            column: ColumnSpec::new("alt_text", "TEXT"),
        },
    },
    MigrationStep {
        id: "seed_comments_enabled",
        action: MigrationAction::SeedSetting {
            key: "comments_enabled",
            value: "1",
        },
    },
    MigrationStep {
        id: "seed_site_timezone",
        action: MigrationAction::SeedSetting {
            key: "site_timezone",
            value: "UTC",
        },
    },
    MigrationStep {
        id: "seed_posts_per_page",
        action: MigrationAction::SeedSetting {
            key: "posts_per_page",
            value: "10",
        },
    },
];
