//! Flow-run records, ordered by modification time. The single-letter exit
//! code in the source schema is widened to a word; an unrecognized code is
//! treated as an expiry, and since expiries always carry an exit timestamp
//! the query substitutes now() when the source column is NULL.

pub const LOOKUP_FLOW_RUNS: &str = r#"
SELECT rec.exited_on, row_to_json(rec)::text
FROM (
  SELECT
    fr.id,
    fr.uuid,
    json_build_object('uuid', ff.uuid, 'name', ff.name) AS flow,
    CASE WHEN $2
      THEN json_build_object('uuid', cc.uuid)
      ELSE json_build_object('uuid', cc.uuid, 'name', cc.name)
    END AS contact,
    fr.responded,
    fr.path AS path,
    fr.results AS "values",
    fr.events AS events,
    fr.created_on,
    fr.modified_on,
    CASE WHEN fr.exit_type IN ('C', 'I', 'E', 'F')
      THEN fr.exited_on
      ELSE coalesce(fr.exited_on, now())
    END AS exited_on,
    CASE WHEN fr.exit_type = 'C' THEN 'completed'
         WHEN fr.exit_type = 'I' THEN 'interrupted'
         WHEN fr.exit_type = 'E' THEN 'expired'
         WHEN fr.exit_type = 'F' THEN 'failed'
         ELSE 'expired'
    END AS exit_type,
    au.username AS submitted_by
  FROM flows_flowrun fr
  JOIN flows_flow ff ON fr.flow_id = ff.id
  JOIN contacts_contact cc ON fr.contact_id = cc.id
  LEFT JOIN auth_user au ON fr.submitted_by_id = au.id
  WHERE fr.org_id = $1 AND fr.modified_on >= $3 AND fr.modified_on < $4
) rec
ORDER BY rec.modified_on ASC, rec.id ASC
"#;
