diesel::table! {
    departments (id) {
        id -> Uuid,
        name -> Text,
        description -> Nullable<Text>,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    users (id) {
        id -> Uuid,
        username -> Text,
        email -> Text,
        full_name -> Text,
        role -> Text,
        student_number -> Nullable<Text>,
        department_id -> Nullable<Uuid>,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_categories (id) {
        id -> Uuid,
        name -> Text,
        icon -> Text,
        color -> Text,
        description -> Nullable<Text>,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    tickets (id) {
        id -> Uuid,
        ticket_number -> Text,
        title -> Text,
        description -> Text,
        status -> Text,
        priority -> Text,
        student_id -> Uuid,
        category_id -> Uuid,
        department_id -> Uuid,
        assignee_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        resolved_at -> Nullable<Timestamptz>,
        satisfaction_rating -> Nullable<Int4>,
    }
}

diesel::table! {
    ticket_responses (id) {
        id -> Uuid,
        ticket_id -> Uuid,
        author_id -> Uuid,
        message -> Text,
        is_internal -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(tickets -> ticket_categories (category_id));
diesel::joinable!(tickets -> departments (department_id));
diesel::joinable!(ticket_responses -> tickets (ticket_id));
diesel::joinable!(ticket_responses -> users (author_id));

diesel::allow_tables_to_appear_in_same_query!(
    departments,
    users,
    ticket_categories,
    tickets,
    ticket_responses,
);
