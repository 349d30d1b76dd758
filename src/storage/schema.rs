// 门户表结构引导：只创建缺失的表，从不修改已有表。
use crate::core::error::MaintenanceError;
use crate::storage::{ConnectionHandle, QueryKind};

pub const PORTAL_TABLES: &[&str] = &[
    "Users",
    "Clubs",
    "Carnivals",
    "EmailSubscriptions",
    "CarnivalClubs",
    "ClubPlayers",
    "Sponsors",
    "AuditLogs",
];

const PORTAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS Clubs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  clubName TEXT NOT NULL,
  state TEXT,
  location TEXT,
  contactEmail TEXT,
  isActive INTEGER NOT NULL DEFAULT 1,
  isPubliclyListed INTEGER NOT NULL DEFAULT 1,
  createdAt TEXT NOT NULL,
  updatedAt TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS Users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT NOT NULL UNIQUE,
  firstName TEXT,
  lastName TEXT,
  clubId INTEGER REFERENCES Clubs (id),
  isPrimaryDelegate INTEGER NOT NULL DEFAULT 0,
  isAdmin INTEGER NOT NULL DEFAULT 0,
  isActive INTEGER NOT NULL DEFAULT 1,
  invitationToken TEXT,
  tokenExpires TEXT,
  lastLoginAt TEXT,
  createdAt TEXT NOT NULL,
  updatedAt TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS Carnivals (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  date TEXT NOT NULL,
  endDate TEXT,
  locationAddress TEXT,
  state TEXT,
  clubId INTEGER REFERENCES Clubs (id),
  createdByUserId INTEGER REFERENCES Users (id),
  isActive INTEGER NOT NULL DEFAULT 1,
  isManuallyEntered INTEGER NOT NULL DEFAULT 1,
  mySidelineId TEXT,
  archivedAt TEXT,
  createdAt TEXT NOT NULL,
  updatedAt TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS EmailSubscriptions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT NOT NULL,
  states TEXT,
  isActive INTEGER NOT NULL DEFAULT 1,
  unsubscribeToken TEXT,
  subscribedAt TEXT,
  unsubscribedAt TEXT,
  createdAt TEXT NOT NULL,
  updatedAt TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS CarnivalClubs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  carnivalId INTEGER NOT NULL REFERENCES Carnivals (id),
  clubId INTEGER NOT NULL REFERENCES Clubs (id),
  isPaid INTEGER NOT NULL DEFAULT 0,
  isActive INTEGER NOT NULL DEFAULT 1,
  createdAt TEXT NOT NULL,
  updatedAt TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ClubPlayers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  clubId INTEGER NOT NULL REFERENCES Clubs (id),
  firstName TEXT NOT NULL,
  lastName TEXT NOT NULL,
  dateOfBirth TEXT,
  isActive INTEGER NOT NULL DEFAULT 1,
  createdAt TEXT NOT NULL,
  updatedAt TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS Sponsors (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  sponsorName TEXT NOT NULL,
  sponsorshipLevel TEXT,
  isActive INTEGER NOT NULL DEFAULT 1,
  createdAt TEXT NOT NULL,
  updatedAt TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS AuditLogs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  userId INTEGER REFERENCES Users (id),
  action TEXT NOT NULL,
  entityType TEXT,
  entityId INTEGER,
  createdAt TEXT NOT NULL
);
"#;

pub fn ensure_portal_tables(handle: &dyn ConnectionHandle) -> Result<(), MaintenanceError> {
    handle.execute(PORTAL_SCHEMA, QueryKind::Raw)?;
    Ok(())
}
