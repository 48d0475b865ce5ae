/// MIGRATION 0001: Catalog tables read and written by the database jobs.
pub const MIGRATION_0001: &str = r#"
-- Collection locations. status 0 means the location is reachable.
CREATE TABLE IF NOT EXISTS AlbumRoots (
    id INTEGER PRIMARY KEY,
    label TEXT,
    status INTEGER NOT NULL DEFAULT 0,
    specificPath TEXT NOT NULL UNIQUE
);

-- One album per directory, relativePath starts with '/'.
CREATE TABLE IF NOT EXISTS Albums (
    id INTEGER PRIMARY KEY,
    albumRoot INTEGER NOT NULL,
    relativePath TEXT NOT NULL,
    date DATE,
    caption TEXT,
    FOREIGN KEY (albumRoot) REFERENCES AlbumRoots (id) ON DELETE CASCADE,
    UNIQUE (albumRoot, relativePath)
);

-- status 1 means visible; dates are stored as 'YYYY-MM-DDTHH:MM:SS'.
CREATE TABLE IF NOT EXISTS Images (
    id INTEGER PRIMARY KEY,
    album INTEGER,
    name TEXT NOT NULL,
    status INTEGER NOT NULL,
    category INTEGER NOT NULL,
    modificationDate DATETIME,
    fileSize INTEGER,
    uniqueHash TEXT,
    FOREIGN KEY (album) REFERENCES Albums (id) ON DELETE CASCADE,
    UNIQUE (album, name)
);

CREATE TABLE IF NOT EXISTS ImageInformation (
    imageid INTEGER PRIMARY KEY,
    rating INTEGER,
    creationDate DATETIME,
    width INTEGER,
    height INTEGER,
    format TEXT,
    FOREIGN KEY (imageid) REFERENCES Images (id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS ImagePositions (
    imageid INTEGER PRIMARY KEY,
    latitudeNumber REAL,
    longitudeNumber REAL,
    altitude REAL,
    FOREIGN KEY (imageid) REFERENCES Images (id) ON DELETE CASCADE
);

-- pid 0 is the tag tree root.
CREATE TABLE IF NOT EXISTS Tags (
    id INTEGER PRIMARY KEY,
    pid INTEGER NOT NULL DEFAULT 0,
    name TEXT NOT NULL,
    UNIQUE (name, pid)
);

CREATE TABLE IF NOT EXISTS ImageTags (
    imageid INTEGER NOT NULL,
    tagid INTEGER NOT NULL,
    FOREIGN KEY (imageid) REFERENCES Images (id) ON DELETE CASCADE,
    FOREIGN KEY (tagid) REFERENCES Tags (id) ON DELETE CASCADE,
    UNIQUE (imageid, tagid)
);

CREATE TABLE IF NOT EXISTS ImageTagProperties (
    imageid INTEGER NOT NULL,
    tagid INTEGER NOT NULL,
    property TEXT NOT NULL,
    value TEXT,
    FOREIGN KEY (imageid) REFERENCES Images (id) ON DELETE CASCADE
);

-- Saved searches; duplicate groups use type 4 with the reference image id as name.
CREATE TABLE IF NOT EXISTS Searches (
    id INTEGER PRIMARY KEY,
    type INTEGER NOT NULL,
    name TEXT NOT NULL,
    query TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ImageHaarMatrix (
    imageid INTEGER PRIMARY KEY,
    modificationDate DATETIME,
    uniqueHash TEXT,
    matrix BLOB NOT NULL,
    FOREIGN KEY (imageid) REFERENCES Images (id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_images_album ON Images (album);
CREATE INDEX IF NOT EXISTS idx_images_hash ON Images (uniqueHash);
CREATE INDEX IF NOT EXISTS idx_information_creation ON ImageInformation (creationDate);
CREATE INDEX IF NOT EXISTS idx_positions_lat_lng ON ImagePositions (latitudeNumber, longitudeNumber);
CREATE INDEX IF NOT EXISTS idx_imagetags_tag ON ImageTags (tagid);
CREATE INDEX IF NOT EXISTS idx_tagproperties_tag ON ImageTagProperties (tagid, property);
CREATE INDEX IF NOT EXISTS idx_searches_type_name ON Searches (type, name);
"#;
