use crate::coredb::{CoreDb, ImageLister, ListerOptions, ListerReceiver};
use crate::error::{Error, Result};
use crate::haar::Signature;
use crate::haariface::{HaarIface, SignatureEntry, SignatureStore};
use crate::models::{
    AlbumId, DuplicateGroup, DuplicatesQuery, HaarQueryType, HaarSearchQuery, ImageCategory,
    ImageId, ImageListerRecord, SearchFilter, SearchInfo, SearchType, TagId,
};
use crate::schema;
use chrono::{NaiveDate, NaiveDateTime};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Params, Row};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const IMAGE_VISIBLE: i64 = 1;

const RECORD_COLUMNS: &str = "Images.id, Images.name, Images.album, Albums.albumRoot, \
    ImageInformation.rating, Images.category, ImageInformation.format, \
    ImageInformation.creationDate, Images.modificationDate, Images.fileSize, \
    ImageInformation.width, ImageInformation.height";
const RECORD_COLUMN_COUNT: usize = 12;
const RECORD_JOINS: &str = "FROM Images \
    JOIN Albums ON Albums.id = Images.album \
    JOIN AlbumRoots ON AlbumRoots.id = Albums.albumRoot \
    LEFT JOIN ImageInformation ON ImageInformation.imageid = Images.id";

/// Values written for a newly scanned file.
#[derive(Debug, Clone, Default)]
pub struct NewImage {
    pub album_id: AlbumId,
    pub name: String,
    pub category: ImageCategory,
    pub modification_date: Option<NaiveDateTime>,
    pub file_size: i64,
    pub unique_hash: String,
    pub rating: Option<i32>,
    pub creation_date: Option<NaiveDateTime>,
    pub width: i32,
    pub height: i32,
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageStatus {
    pub id: ImageId,
    pub modification_date: Option<NaiveDateTime>,
    pub file_size: i64,
    pub has_signature: bool,
}

/// Extra values appended to each listed record.
#[derive(Debug, Clone, Copy)]
enum Extra {
    None,
    /// Latitude and longitude.
    Coordinates,
    /// Numbers of a comma separated property value, e.g. a face region.
    PropertyValue,
}

/// The SQLite catalog. Cloning shares the connection pool.
#[derive(Clone)]
pub struct CatalogDb {
    pool: DbPool,
}

impl CatalogDb {
    /// Opens (or creates) the catalog at `db_path` and runs migrations.
    pub fn open(db_path: &Path) -> Result<Self> {
        log::info!("Database path: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = r2d2::Pool::new(manager)?;
        run_migrations(&pool.get()?)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Returns the id of the root at `path`, registering it if needed.
    pub fn add_album_root(&self, path: &str, label: &str) -> Result<i32> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO AlbumRoots (label, status, specificPath) VALUES (?1, 0, ?2)",
            params![label, path],
        )?;
        let id = conn.query_row(
            "SELECT id FROM AlbumRoots WHERE specificPath = ?1",
            params![path],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn set_album_root_available(&self, root_id: i32, available: bool) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE AlbumRoots SET status = ?2 WHERE id = ?1",
            params![root_id, if available { 0 } else { 1 }],
        )?;
        Ok(())
    }

    pub fn add_album(&self, root_id: i32, relative_path: &str, date: Option<NaiveDate>) -> Result<AlbumId> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO Albums (albumRoot, relativePath, date) VALUES (?1, ?2, ?3)",
            params![root_id, relative_path, date.map(|d| d.to_string())],
        )?;
        let id = conn.query_row(
            "SELECT id FROM Albums WHERE albumRoot = ?1 AND relativePath = ?2",
            params![root_id, relative_path],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn add_tag(&self, parent: Option<TagId>, name: &str) -> Result<TagId> {
        let conn = self.pool.get()?;
        let pid = parent.unwrap_or(0);
        conn.execute(
            "INSERT OR IGNORE INTO Tags (pid, name) VALUES (?1, ?2)",
            params![pid, name],
        )?;
        let id = conn.query_row(
            "SELECT id FROM Tags WHERE pid = ?1 AND name = ?2",
            params![pid, name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Inserts the image, or refreshes it when the album already holds a
    /// file of that name.
    pub fn add_image(&self, image: &NewImage) -> Result<ImageId> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO Images (album, name, status, category, modificationDate, fileSize, uniqueHash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(album, name) DO UPDATE SET
                status = excluded.status,
                category = excluded.category,
                modificationDate = excluded.modificationDate,
                fileSize = excluded.fileSize,
                uniqueHash = excluded.uniqueHash",
            params![
                image.album_id,
                image.name,
                IMAGE_VISIBLE,
                image.category.to_db(),
                format_datetime(image.modification_date),
                image.file_size,
                image.unique_hash,
            ],
        )?;
        let id: ImageId = conn.query_row(
            "SELECT id FROM Images WHERE album = ?1 AND name = ?2",
            params![image.album_id, image.name],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO ImageInformation (imageid, rating, creationDate, width, height, format)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                image.rating,
                format_datetime(image.creation_date),
                image.width,
                image.height,
                image.format,
            ],
        )?;
        Ok(id)
    }

    pub fn image_status(&self, album_id: AlbumId, name: &str) -> Result<Option<ImageStatus>> {
        let conn = self.pool.get()?;
        let status = conn
            .query_row(
                "SELECT Images.id, Images.modificationDate, Images.fileSize,
                        EXISTS (SELECT 1 FROM ImageHaarMatrix WHERE imageid = Images.id)
                 FROM Images WHERE album = ?1 AND name = ?2",
                params![album_id, name],
                |row| {
                    Ok(ImageStatus {
                        id: row.get(0)?,
                        modification_date: parse_datetime(row.get(1)?),
                        file_size: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        has_signature: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(status)
    }

    pub fn add_image_tag(&self, image_id: ImageId, tag_id: TagId) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO ImageTags (imageid, tagid) VALUES (?1, ?2)",
            params![image_id, tag_id],
        )?;
        Ok(())
    }

    pub fn add_image_tag_property(
        &self,
        image_id: ImageId,
        tag_id: TagId,
        property: &str,
        value: &str,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO ImageTagProperties (imageid, tagid, property, value) VALUES (?1, ?2, ?3, ?4)",
            params![image_id, tag_id, property, value],
        )?;
        Ok(())
    }

    pub fn set_image_position(&self, image_id: ImageId, latitude: f64, longitude: f64) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO ImagePositions (imageid, latitudeNumber, longitudeNumber) VALUES (?1, ?2, ?3)",
            params![image_id, latitude, longitude],
        )?;
        Ok(())
    }

    pub fn add_search(&self, kind: SearchType, name: &str, query: &str) -> Result<i32> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO Searches (type, name, query) VALUES (?1, ?2, ?3)",
            params![kind.to_db(), name, query],
        )?;
        Ok(conn.last_insert_rowid() as i32)
    }

    /// Stored duplicate groups, by reference image id.
    pub fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT name, query FROM Searches WHERE type = ?1 ORDER BY CAST(name AS INTEGER)",
        )?;
        let rows = stmt
            .query_map(params![SearchType::Duplicates.to_db()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut groups = Vec::with_capacity(rows.len());
        for (name, query) in rows {
            let reference = name
                .parse::<ImageId>()
                .map_err(|_| Error::Query(format!("Duplicates search with invalid name {name:?}")))?;
            let query: DuplicatesQuery = serde_json::from_str(&query)?;
            groups.push(DuplicateGroup {
                reference,
                similarities: query.similarities,
            });
        }
        Ok(groups)
    }

    fn for_each_record<P, F>(&self, sql: &str, params: P, mut visit: F) -> Result<()>
    where
        P: Params,
        F: FnMut(&Row<'_>, ImageListerRecord) -> Result<bool>,
    {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        while let Some(row) = rows.next()? {
            let record = record_from_row(row)?;
            if !visit(row, record)? {
                break;
            }
        }
        Ok(())
    }

    fn feed<P: Params>(
        &self,
        receiver: &mut dyn ListerReceiver,
        sql: &str,
        params: P,
        extra: Extra,
    ) -> Result<()> {
        self.for_each_record(sql, params, |row, mut record| {
            if receiver.is_canceled() {
                return Ok(false);
            }
            match extra {
                Extra::None => {}
                Extra::Coordinates => {
                    for column in RECORD_COLUMN_COUNT..RECORD_COLUMN_COUNT + 2 {
                        record
                            .extra_values
                            .push(row.get::<_, Option<f64>>(column)?.unwrap_or_default());
                    }
                }
                Extra::PropertyValue => {
                    let value: Option<String> = row.get(RECORD_COLUMN_COUNT)?;
                    record.extra_values = value.as_deref().map(parse_numbers).unwrap_or_default();
                }
            }
            receiver.receive(record);
            Ok(true)
        })
    }

    fn tag_closure(&self, tag_ids: &[TagId], recursive: bool) -> Result<Vec<TagId>> {
        if !recursive || tag_ids.is_empty() {
            return Ok(tag_ids.to_vec());
        }
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT id, pid FROM Tags")?;
        let pairs = stmt
            .query_map(params![], |row| Ok((row.get::<_, TagId>(0)?, row.get::<_, TagId>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut children: HashMap<TagId, Vec<TagId>> = HashMap::new();
        for (id, pid) in pairs {
            children.entry(pid).or_default().push(id);
        }
        let mut closure = BTreeSet::new();
        let mut stack = tag_ids.to_vec();
        while let Some(id) = stack.pop() {
            if closure.insert(id) {
                if let Some(kids) = children.get(&id) {
                    stack.extend(kids);
                }
            }
        }
        Ok(closure.into_iter().collect())
    }

    fn counts<P: Params>(&self, sql: &str, params: P) -> Result<HashMap<i32, i32>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let counts = stmt
            .query_map(params, |row| Ok((row.get::<_, i32>(0)?, row.get::<_, i32>(1)?)))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(counts)
    }

    fn haar_matches(&self, query: &str) -> Result<Vec<(ImageId, f64)>> {
        let query: HaarSearchQuery = serde_json::from_str(query)?;
        let threshold = query.threshold.unwrap_or(0.9).max(0.1);
        let max_threshold = query.max_threshold.unwrap_or(1.0).max(threshold);
        let haar = HaarIface::new(Arc::new(self.clone()), query.sketch_type);
        match query.query_type {
            HaarQueryType::ImageId => {
                let image_id = query
                    .image_id
                    .ok_or_else(|| Error::Query("Similarity search without an image id".into()))?;
                haar.best_matches_for_image_with_threshold(
                    image_id,
                    threshold,
                    max_threshold,
                    &query.target_albums,
                )
            }
            HaarQueryType::Image => {
                let path = query
                    .path
                    .ok_or_else(|| Error::Query("Similarity search without an image path".into()))?;
                let signature = Signature::from_path(Path::new(&path))?;
                haar.best_matches_for_signature(
                    &signature,
                    None,
                    threshold,
                    max_threshold,
                    &query.target_albums,
                )
            }
        }
    }

    fn haar_listing(
        &self,
        options: ListerOptions,
        receiver: &mut dyn ListerReceiver,
        query: &str,
    ) -> Result<()> {
        let matches = self.haar_matches(query)?;
        if matches.is_empty() {
            return Ok(());
        }
        let ids: Vec<ImageId> = matches.iter().map(|(id, _)| *id).collect();
        let similarity: HashMap<ImageId, f64> = matches.into_iter().collect();

        let sql = record_select(options, "", &format!("Images.id IN ({})", id_list(&ids)), "Images.id");
        let mut records = Vec::with_capacity(ids.len());
        self.for_each_record(&sql, params![], |_, mut record| {
            record.current_similarity = similarity.get(&record.image_id).copied();
            records.push(record);
            Ok(true)
        })?;
        records.sort_by(|a, b| {
            let a_sim = a.current_similarity.unwrap_or_default();
            let b_sim = b.current_similarity.unwrap_or_default();
            b_sim.total_cmp(&a_sim).then(a.image_id.cmp(&b.image_id))
        });
        for record in records {
            if receiver.is_canceled() {
                break;
            }
            receiver.receive(record);
        }
        Ok(())
    }

    fn search_listing(
        &self,
        options: ListerOptions,
        receiver: &mut dyn ListerReceiver,
        query: &str,
        limit: Option<usize>,
        reference_image_id: Option<ImageId>,
    ) -> Result<()> {
        let filter: SearchFilter = serde_json::from_str(query)?;
        let duplicates = reference_image_id.and_then(|_| serde_json::from_str::<DuplicatesQuery>(query).ok());

        let mut conditions = vec!["1 = 1".to_string()];
        let mut values: Vec<Value> = Vec::new();
        if !filter.album_ids.is_empty() {
            conditions.push(format!("Images.album IN ({})", id_list(&filter.album_ids)));
        }
        if !filter.tag_ids.is_empty() {
            conditions.push(format!(
                "Images.id IN (SELECT imageid FROM ImageTags WHERE tagid IN ({}))",
                id_list(&filter.tag_ids)
            ));
        }
        if !filter.image_ids.is_empty() {
            conditions.push(format!("Images.id IN ({})", id_list(&filter.image_ids)));
        }
        if let Some(rating) = filter.min_rating {
            conditions.push("ImageInformation.rating >= ?".into());
            values.push(Value::Integer(i64::from(rating)));
        }
        if let Some(text) = &filter.name_contains {
            conditions.push("Images.name LIKE ?".into());
            values.push(Value::Text(format!("%{text}%")));
        }

        let mut sql = record_select(options, "", &conditions.join(" AND "), "Images.id");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        self.for_each_record(&sql, params_from_iter(values), |_, mut record| {
            if receiver.is_canceled() {
                return Ok(false);
            }
            if let Some(duplicates) = &duplicates {
                record.current_similarity = if Some(record.image_id) == reference_image_id {
                    Some(1.0)
                } else {
                    duplicates.similarities.get(&record.image_id).copied()
                };
            }
            receiver.receive(record);
            Ok(true)
        })
    }
}

/// Applies all pending database migrations.
fn run_migrations(connection: &DbConnection) -> Result<()> {
    log::info!("Running database migrations...");
    connection.execute_batch(schema::MIGRATION_0001)?;
    log::info!("Migrations applied successfully.");
    Ok(())
}

fn record_select(options: ListerOptions, extra: &str, condition: &str, order: &str) -> String {
    let availability = if options.list_only_available {
        " AND AlbumRoots.status = 0"
    } else {
        ""
    };
    format!(
        "SELECT {RECORD_COLUMNS}{extra} {RECORD_JOINS} \
         WHERE Images.status = {IMAGE_VISIBLE}{availability} AND ({condition}) ORDER BY {order}"
    )
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ImageListerRecord> {
    Ok(ImageListerRecord {
        image_id: row.get(0)?,
        name: row.get(1)?,
        album_id: row.get(2)?,
        album_root_id: row.get(3)?,
        rating: row.get::<_, Option<i32>>(4)?.unwrap_or(0),
        category: ImageCategory::from_db(row.get(5)?),
        format: row.get(6)?,
        creation_date: parse_datetime(row.get(7)?),
        modification_date: parse_datetime(row.get(8)?),
        file_size: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
        width: row.get::<_, Option<i32>>(10)?.unwrap_or(0),
        height: row.get::<_, Option<i32>>(11)?.unwrap_or(0),
        current_similarity: None,
        extra_values: Vec::new(),
    })
}

fn parse_datetime(value: Option<String>) -> Option<NaiveDateTime> {
    value.and_then(|s| NaiveDateTime::parse_from_str(&s, DATETIME_FORMAT).ok())
}

fn format_datetime(value: Option<NaiveDateTime>) -> Option<String> {
    value.map(|d| d.format(DATETIME_FORMAT).to_string())
}

fn parse_numbers(value: &str) -> Vec<f64> {
    value
        .split(',')
        .filter_map(|part| part.trim().parse::<f64>().ok())
        .collect()
}

fn id_list<T: ToString>(ids: &[T]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

fn report(receiver: &mut dyn ListerReceiver, result: Result<()>) {
    if let Err(err) = result {
        log::warn!("Image listing failed: {err}");
        receiver.error(err.to_string());
    }
}

impl CoreDb for CatalogDb {
    fn number_of_images_in_albums(&self) -> Result<HashMap<AlbumId, i32>> {
        self.counts(
            "SELECT album, COUNT(*) FROM Images WHERE status = ?1 AND album IS NOT NULL GROUP BY album",
            params![IMAGE_VISIBLE],
        )
    }

    fn number_of_images_in_tags(&self) -> Result<HashMap<TagId, i32>> {
        self.counts(
            "SELECT ImageTags.tagid, COUNT(*) FROM ImageTags
             JOIN Images ON Images.id = ImageTags.imageid
             WHERE Images.status = ?1 GROUP BY ImageTags.tagid",
            params![IMAGE_VISIBLE],
        )
    }

    fn number_of_images_in_tag_properties(&self, property: &str) -> Result<HashMap<TagId, i32>> {
        self.counts(
            "SELECT ImageTagProperties.tagid, COUNT(DISTINCT ImageTagProperties.imageid)
             FROM ImageTagProperties
             JOIN Images ON Images.id = ImageTagProperties.imageid
             WHERE Images.status = ?1 AND ImageTagProperties.property = ?2
             GROUP BY ImageTagProperties.tagid",
            params![IMAGE_VISIBLE, property],
        )
    }

    fn all_creation_dates_and_number_of_images(&self) -> Result<BTreeMap<NaiveDate, i32>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT substr(ImageInformation.creationDate, 1, 10), COUNT(*)
             FROM Images JOIN ImageInformation ON ImageInformation.imageid = Images.id
             WHERE Images.status = ?1 AND ImageInformation.creationDate IS NOT NULL
             GROUP BY 1",
        )?;
        let rows = stmt
            .query_map(params![IMAGE_VISIBLE], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i32>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut dates = BTreeMap::new();
        for (day, count) in rows {
            match NaiveDate::parse_from_str(&day, "%Y-%m-%d") {
                Ok(date) => {
                    dates.insert(date, count);
                }
                Err(_) => log::warn!("Skipping malformed creation date {day:?}"),
            }
        }
        Ok(dates)
    }

    fn image_ids_from_area(
        &self,
        lat1: f64,
        lat2: f64,
        lng1: f64,
        lng2: f64,
        limit: Option<usize>,
        sort_key: &str,
    ) -> Result<Vec<ImageId>> {
        let order = match sort_key {
            "rating" => "ImageInformation.rating DESC, Images.id",
            "date" | "creationdate" => "ImageInformation.creationDate, Images.id",
            _ => "Images.id",
        };
        let sql = format!(
            "SELECT Images.id FROM ImagePositions
             JOIN Images ON Images.id = ImagePositions.imageid
             LEFT JOIN ImageInformation ON ImageInformation.imageid = Images.id
             WHERE Images.status = ?1
               AND ImagePositions.latitudeNumber BETWEEN ?2 AND ?3
               AND ImagePositions.longitudeNumber BETWEEN ?4 AND ?5
             ORDER BY {order} LIMIT ?6"
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(
                params![
                    IMAGE_VISIBLE,
                    lat1.min(lat2),
                    lat1.max(lat2),
                    lng1.min(lng2),
                    lng1.max(lng2),
                    limit
                ],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<Vec<ImageId>>>()?;
        Ok(ids)
    }

    fn search_info(&self, id: i32) -> Result<Option<SearchInfo>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT id, type, name, query FROM Searches WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i32>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id, kind, name, query)) => {
                let kind = SearchType::from_db(kind)
                    .ok_or_else(|| Error::Query(format!("Search {id} has unknown type {kind}")))?;
                Ok(Some(SearchInfo { id, kind, name, query }))
            }
            None => Ok(None),
        }
    }
}

impl ImageLister for CatalogDb {
    fn list_album(
        &self,
        options: ListerOptions,
        receiver: &mut dyn ListerReceiver,
        album_root_id: i32,
        album: &str,
    ) {
        let result = if options.recursive {
            let prefix = format!("{}/%", album.trim_end_matches('/'));
            let sql = record_select(
                options,
                "",
                "Albums.albumRoot = ?1 AND (Albums.relativePath = ?2 OR Albums.relativePath LIKE ?3)",
                "Albums.relativePath, Images.name",
            );
            self.feed(receiver, &sql, params![album_root_id, album, prefix], Extra::None)
        } else {
            let sql = record_select(
                options,
                "",
                "Albums.albumRoot = ?1 AND Albums.relativePath = ?2",
                "Images.name",
            );
            self.feed(receiver, &sql, params![album_root_id, album], Extra::None)
        };
        report(receiver, result);
    }

    fn list_tag(&self, options: ListerOptions, receiver: &mut dyn ListerReceiver, tag_ids: &[TagId]) {
        let result = self.tag_closure(tag_ids, options.recursive).and_then(|tags| {
            if tags.is_empty() {
                return Ok(());
            }
            let condition = format!(
                "Images.id IN (SELECT imageid FROM ImageTags WHERE tagid IN ({}))",
                id_list(&tags)
            );
            let sql = record_select(options, "", &condition, "Images.id");
            self.feed(receiver, &sql, params![], Extra::None)
        });
        report(receiver, result);
    }

    fn list_date_range(
        &self,
        options: ListerOptions,
        receiver: &mut dyn ListerReceiver,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) {
        let sql = record_select(
            options,
            "",
            "ImageInformation.creationDate IS NOT NULL
             AND (?1 IS NULL OR ImageInformation.creationDate >= ?1)
             AND (?2 IS NULL OR ImageInformation.creationDate < ?2)",
            "ImageInformation.creationDate, Images.id",
        );
        let result = self.feed(
            receiver,
            &sql,
            params![start.map(|d| d.to_string()), end.map(|d| d.to_string())],
            Extra::None,
        );
        report(receiver, result);
    }

    fn list_area_range(
        &self,
        options: ListerOptions,
        receiver: &mut dyn ListerReceiver,
        lat1: f64,
        lat2: f64,
        lng1: f64,
        lng2: f64,
    ) {
        let sql = record_select(
            options,
            ", ImagePositions.latitudeNumber, ImagePositions.longitudeNumber",
            "Images.id IN (SELECT imageid FROM ImagePositions
                           WHERE latitudeNumber BETWEEN ?1 AND ?2
                             AND longitudeNumber BETWEEN ?3 AND ?4)",
            "Images.id",
        )
        .replace(
            RECORD_JOINS,
            &format!("{RECORD_JOINS} JOIN ImagePositions ON ImagePositions.imageid = Images.id"),
        );
        let extra = if options.allow_extra_values {
            Extra::Coordinates
        } else {
            Extra::None
        };
        let result = self.feed(
            receiver,
            &sql,
            params![lat1.min(lat2), lat1.max(lat2), lng1.min(lng2), lng1.max(lng2)],
            extra,
        );
        report(receiver, result);
    }

    fn list_search(
        &self,
        options: ListerOptions,
        receiver: &mut dyn ListerReceiver,
        query: &str,
        limit: Option<usize>,
        reference_image_id: Option<ImageId>,
    ) {
        let result = self.search_listing(options, receiver, query, limit, reference_image_id);
        report(receiver, result);
    }

    fn list_haar_search(&self, options: ListerOptions, receiver: &mut dyn ListerReceiver, query: &str) {
        let result = self.haar_listing(options, receiver, query);
        report(receiver, result);
    }

    fn list_image_tag_property_search(
        &self,
        options: ListerOptions,
        receiver: &mut dyn ListerReceiver,
        tag_id: TagId,
        property: &str,
    ) {
        let result = self.tag_closure(&[tag_id], options.recursive).and_then(|tags| {
            let sql = record_select(
                options,
                ", ImageTagProperties.value",
                &format!(
                    "ImageTagProperties.tagid IN ({}) AND ImageTagProperties.property = ?1",
                    id_list(&tags)
                ),
                "Images.id",
            )
            .replace(
                RECORD_JOINS,
                &format!(
                    "{RECORD_JOINS} JOIN ImageTagProperties ON ImageTagProperties.imageid = Images.id"
                ),
            );
            let extra = if options.allow_extra_values {
                Extra::PropertyValue
            } else {
                Extra::None
            };
            self.feed(receiver, &sql, params![property], extra)
        });
        report(receiver, result);
    }
}

impl SignatureStore for CatalogDb {
    fn signatures(&self) -> Result<Vec<SignatureEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT ImageHaarMatrix.imageid, Images.album, ImageHaarMatrix.matrix
             FROM ImageHaarMatrix JOIN Images ON Images.id = ImageHaarMatrix.imageid
             WHERE Images.status = ?1 AND Images.album IS NOT NULL
             ORDER BY ImageHaarMatrix.imageid",
        )?;
        let rows = stmt
            .query_map(params![IMAGE_VISIBLE], |row| {
                Ok((
                    row.get::<_, ImageId>(0)?,
                    row.get::<_, AlbumId>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (image_id, album_id, blob) in rows {
            match Signature::from_bytes(&blob) {
                Ok(signature) => entries.push(SignatureEntry {
                    image_id,
                    album_id,
                    signature,
                }),
                Err(err) => log::warn!("Ignoring signature of image {image_id}: {err}"),
            }
        }
        Ok(entries)
    }

    fn signature(&self, image_id: ImageId) -> Result<Option<Signature>> {
        let conn = self.pool.get()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT matrix FROM ImageHaarMatrix WHERE imageid = ?1",
                params![image_id],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|blob| Signature::from_bytes(&blob)).transpose()
    }

    fn store_signature(&self, image_id: ImageId, signature: &Signature) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "INSERT OR REPLACE INTO ImageHaarMatrix (imageid, modificationDate, uniqueHash, matrix)
             SELECT id, modificationDate, uniqueHash, ?2 FROM Images WHERE id = ?1",
            params![image_id, signature.to_bytes()],
        )?;
        if changed == 0 {
            return Err(Error::Query(format!("No image with id {image_id}")));
        }
        Ok(())
    }

    fn images_in_albums(&self, album_ids: &[AlbumId]) -> Result<BTreeSet<ImageId>> {
        if album_ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM Images WHERE status = ?1 AND album IN ({})",
            id_list(album_ids)
        ))?;
        let ids = stmt
            .query_map(params![IMAGE_VISIBLE], |row| row.get(0))?
            .collect::<rusqlite::Result<BTreeSet<ImageId>>>()?;
        Ok(ids)
    }

    fn images_in_tags(&self, tag_ids: &[TagId]) -> Result<BTreeSet<ImageId>> {
        if tag_ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT ImageTags.imageid FROM ImageTags
             JOIN Images ON Images.id = ImageTags.imageid
             WHERE Images.status = ?1 AND ImageTags.tagid IN ({})",
            id_list(tag_ids)
        ))?;
        let ids = stmt
            .query_map(params![IMAGE_VISIBLE], |row| row.get(0))?
            .collect::<rusqlite::Result<BTreeSet<ImageId>>>()?;
        Ok(ids)
    }

    fn replace_duplicate_groups(&self, roots: &[ImageId], groups: &[DuplicateGroup]) -> Result<()> {
        let kind = SearchType::Duplicates.to_db();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut delete = tx.prepare("DELETE FROM Searches WHERE type = ?1 AND name = ?2")?;
            for root in roots {
                delete.execute(params![kind, root.to_string()])?;
            }
            let mut insert = tx.prepare("INSERT INTO Searches (type, name, query) VALUES (?1, ?2, ?3)")?;
            for group in groups {
                let query = DuplicatesQuery {
                    image_ids: group.image_ids(),
                    similarities: group.similarities.clone(),
                };
                insert.execute(params![kind, group.reference.to_string(), serde_json::to_string(&query)?])?;
            }
        }
        tx.commit()?;
        log::debug!("Stored {} duplicate groups for {} images", groups.len(), roots.len());
        Ok(())
    }
}
