use crate::models::Project;
use crate::{Store, StoreError, now};

impl Store {
    /// Create a project.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the name is taken.
    pub async fn create_project(
        &self,
        name: &str,
        description: &str,
        created_by: &str,
    ) -> Result<Project, StoreError> {
        sqlx::query_as::<_, Project>(
            r"INSERT INTO projects (name, description, created_by, created_at)
              VALUES (?, ?, ?, ?)
              RETURNING id, name, description, created_by, created_at",
        )
        .bind(name)
        .bind(description)
        .bind(created_by)
        .bind(now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::AlreadyExists(_) => StoreError::AlreadyExists(format!("project {name}")),
            other => other,
        })
    }

    /// Look up a project by name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such project exists.
    pub async fn get_project(&self, name: &str) -> Result<Project, StoreError> {
        sqlx::query_as::<_, Project>(
            "SELECT id, name, description, created_by, created_at FROM projects WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("project {name}")))
    }

    /// All projects, by name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let projects = sqlx::query_as::<_, Project>(
            "SELECT id, name, description, created_by, created_at FROM projects ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(projects)
    }

    /// Delete a project. Its environments and grants go with it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such project exists.
    pub async fn delete_project(&self, name: &str) -> Result<(), StoreError> {
        let done = sqlx::query("DELETE FROM projects WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("project {name}")));
        }
        Ok(())
    }

    /// Names of users granted access to a project.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn project_members(&self, project: &str) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar::<_, String>(
            r"SELECT u.name FROM users u
              JOIN user_projects up ON up.user_id = u.id
              JOIN projects p ON p.id = up.project_id
              WHERE p.name = ?
              ORDER BY u.name",
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}
